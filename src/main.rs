//! ClawVM - smart contract execution engine
//!
//! Single binary with subcommands:
//!   clawvm deploy | execute | transfer | update
//!   clawvm info | list | delete | init-config

mod cli;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        None | Some("--help" | "-h" | "help") => cli::print_help(),
        Some("--version" | "-V") => {
            println!("clawvm {}", clawvm::VERSION);
        }
        Some(_) => {
            if let Err(e) = cli::run(&args[1..]) {
                eprintln!("Error: {e:#}");
                std::process::exit(1);
            }
        }
    }
}
