//! Command line front end.
//!
//! Every command opens the registry from the data directory, performs one
//! operation, prints the result as JSON on stdout and flushes the store.
//! Logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

use clawvm::{
    config::{default_data_dir, EngineConfig},
    Address, ContractId, ContractRegistry, SledStore,
};

const CONFIG_FILE: &str = "config.toml";

/// Process exit code when contract code rejected a call
const EXIT_CALL_FAILED: i32 = 2;

/// Options shared by every command
#[derive(Debug, Default, PartialEq)]
struct GlobalOptions {
    config: Option<PathBuf>,
    data_dir: Option<PathBuf>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Deploy {
        code: PathBuf,
        name: String,
        owner: Address,
        init: Option<Json>,
    },
    Execute {
        id: ContractId,
        method: String,
        params: Json,
        sender: Address,
        value: u64,
    },
    Transfer {
        id: ContractId,
        to: Address,
        amount: u64,
        sender: Address,
    },
    Update {
        id: ContractId,
        code: PathBuf,
        sender: Address,
    },
    Info {
        id: ContractId,
        with_state: bool,
    },
    List {
        owner: Option<Address>,
    },
    Delete {
        id: ContractId,
        sender: Address,
    },
    InitConfig {
        force: bool,
    },
}

/// Flag/value cursor over the arguments of one command
struct Args<'a> {
    items: &'a [String],
    pos: usize,
}

impl<'a> Args<'a> {
    fn new(items: &'a [String]) -> Self {
        Self { items, pos: 0 }
    }

    fn next_arg(&mut self) -> Option<&'a str> {
        let item = self.items.get(self.pos)?;
        self.pos += 1;
        Some(item.as_str())
    }

    fn value(&mut self, flag: &str) -> anyhow::Result<&'a str> {
        self.next_arg().ok_or_else(|| anyhow!("{flag} needs a value"))
    }
}

fn parse_json(flag: &str, text: &str) -> anyhow::Result<Json> {
    serde_json::from_str(text).with_context(|| format!("{flag} is not valid JSON"))
}

fn parse_amount(flag: &str, text: &str) -> anyhow::Result<u64> {
    text.parse()
        .with_context(|| format!("{flag} must be a non-negative integer"))
}

fn required<T>(value: Option<T>, flag: &str) -> anyhow::Result<T> {
    value.ok_or_else(|| anyhow!("missing {flag}"))
}

fn parse_args(args: &[String]) -> anyhow::Result<(GlobalOptions, Command)> {
    let mut global = GlobalOptions::default();
    let mut args = Args::new(args);

    let name = loop {
        match args.next_arg() {
            Some("--config" | "-c") => global.config = Some(args.value("--config")?.into()),
            Some("--data-dir" | "-d") => global.data_dir = Some(args.value("--data-dir")?.into()),
            Some(cmd) => break cmd,
            None => bail!("no command given; see clawvm --help"),
        }
    };

    let mut positional: Vec<&str> = Vec::new();
    let mut code = None;
    let mut name_flag = None;
    let mut owner = None;
    let mut init = None;
    let mut params = None;
    let mut sender = None;
    let mut value = 0;
    let mut to = None;
    let mut amount = None;
    let mut with_state = false;
    let mut force = false;

    while let Some(arg) = args.next_arg() {
        match arg {
            "--code" => code = Some(PathBuf::from(args.value(arg)?)),
            "--name" => name_flag = Some(args.value(arg)?.to_string()),
            "--owner" => owner = Some(Address::new(args.value(arg)?)),
            "--init" => init = Some(parse_json(arg, args.value(arg)?)?),
            "--params" => params = Some(parse_json(arg, args.value(arg)?)?),
            "--sender" | "-s" => sender = Some(Address::new(args.value(arg)?)),
            "--value" => value = parse_amount(arg, args.value(arg)?)?,
            "--to" => to = Some(Address::new(args.value(arg)?)),
            "--amount" => amount = Some(parse_amount(arg, args.value(arg)?)?),
            "--state" => with_state = true,
            "--force" => force = true,
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            other => positional.push(other),
        }
    }

    let mut positional = positional.into_iter();
    let mut id = || -> anyhow::Result<ContractId> {
        positional
            .next()
            .map(Address::new)
            .ok_or_else(|| anyhow!("missing contract id"))
    };

    let command = match name {
        "deploy" => Command::Deploy {
            code: required(code, "--code")?,
            name: required(name_flag, "--name")?,
            owner: required(owner, "--owner")?,
            init,
        },
        "execute" => {
            let contract = id()?;
            let method = id().map_err(|_| anyhow!("missing method name"))?;
            Command::Execute {
                id: contract,
                method: method.as_str().to_string(),
                params: params.unwrap_or_else(|| Json::Object(serde_json::Map::new())),
                sender: required(sender, "--sender")?,
                value,
            }
        }
        "transfer" => Command::Transfer {
            id: id()?,
            to: required(to, "--to")?,
            amount: required(amount, "--amount")?,
            sender: required(sender, "--sender")?,
        },
        "update" => Command::Update {
            id: id()?,
            code: required(code, "--code")?,
            sender: required(sender, "--sender")?,
        },
        "info" => Command::Info {
            id: id()?,
            with_state,
        },
        "list" => Command::List { owner },
        "delete" => Command::Delete {
            id: id()?,
            sender: required(sender, "--sender")?,
        },
        "init-config" => Command::InitConfig { force },
        other => bail!("unknown command '{other}'; see clawvm --help"),
    };
    Ok((global, command))
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_code(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))
}

fn init_logging(config: &EngineConfig) -> anyhow::Result<()> {
    // RUST_LOG overrides the configured filter
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.filter));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Run one command
pub fn run(args: &[String]) -> anyhow::Result<()> {
    let (global, command) = parse_args(args)?;

    let data_dir = global.data_dir.unwrap_or_else(default_data_dir);
    let config_path = global.config.unwrap_or_else(|| data_dir.join(CONFIG_FILE));

    if let Command::InitConfig { force } = command {
        if config_path.exists() && !force {
            bail!(
                "{} already exists; pass --force to overwrite",
                config_path.display()
            );
        }
        EngineConfig::default().save_to_file(&config_path)?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }

    let config = EngineConfig::load_or_default(&config_path)
        .with_context(|| format!("cannot load {}", config_path.display()))?;
    init_logging(&config)?;

    let store_path = config.storage_path(&data_dir);
    let store = SledStore::open(&store_path)
        .with_context(|| format!("cannot open store at {}", store_path.display()))?;
    let registry = ContractRegistry::open(config.executor()?, Arc::new(store))?;

    let call_failed = execute_command(&registry, command)?;
    registry.close()?;

    if call_failed {
        std::process::exit(EXIT_CALL_FAILED);
    }
    Ok(())
}

/// Returns whether a contract call was rejected by the contract code
fn execute_command(registry: &ContractRegistry, command: Command) -> anyhow::Result<bool> {
    match command {
        Command::Deploy {
            code,
            name,
            owner,
            init,
        } => {
            let contract = registry.deploy(&read_code(&code)?, &name, &owner, init.as_ref())?;
            print_json(&contract.info())?;
        }
        Command::Execute {
            id,
            method,
            params,
            sender,
            value,
        } => {
            let outcome = registry.execute(&id, &method, params, &sender, value)?;
            print_json(&outcome)?;
            if !outcome.is_success() {
                warn!(contract_id = %id, method = %method, "Call rejected");
                return Ok(true);
            }
        }
        Command::Transfer {
            id,
            to,
            amount,
            sender,
        } => {
            let record = registry.transfer(&id, &to, amount, &sender)?;
            print_json(&record)?;
        }
        Command::Update { id, code, sender } => {
            let info = registry.update(&id, &read_code(&code)?, &sender)?;
            print_json(&info)?;
        }
        Command::Info { id, with_state } => {
            let contract = registry.get(&id)?;
            if with_state {
                print_json(&contract)?;
            } else {
                print_json(&contract.info())?;
            }
        }
        Command::List { owner } => {
            let infos = match owner {
                Some(owner) => registry.list_by_owner(&owner),
                None => registry.list(),
            };
            print_json(&infos)?;
        }
        Command::Delete { id, sender } => {
            registry.delete(&id, &sender)?;
            info!(contract_id = %id, "Deleted");
            print_json(&serde_json::json!({ "deleted": id }))?;
        }
        Command::InitConfig { .. } => {}
    }
    Ok(false)
}

/// Print usage
pub fn print_help() {
    println!("ClawVM v{}", clawvm::VERSION);
    println!("Smart contract execution engine");
    println!();
    println!("USAGE:");
    println!("    clawvm [GLOBAL OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    deploy --code <FILE> --name <NAME> --owner <ADDR> [--init <JSON>]");
    println!("    execute <ID> <METHOD> --sender <ADDR> [--params <JSON>] [--value <N>]");
    println!("    transfer <ID> --to <ADDR> --amount <N> --sender <ADDR>");
    println!("    update <ID> --code <FILE> --sender <ADDR>");
    println!("    info <ID> [--state]");
    println!("    list [--owner <ADDR>]");
    println!("    delete <ID> --sender <ADDR>");
    println!("    init-config [--force]");
    println!();
    println!("GLOBAL OPTIONS:");
    println!("    -c, --config <PATH>     Config file (default: <data-dir>/config.toml)");
    println!("    -d, --data-dir <PATH>   Data directory (default: ~/.clawvm)");
    println!("    -h, --help              Print help");
    println!("    -V, --version           Print version");
    println!();
    println!("A rejected contract call prints the failure and exits with status 2.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_parse_deploy_with_globals() {
        let (global, command) = parse_args(&args(
            "-d /tmp/x deploy --code c.js --name Greeter --owner 0xA --init {\"balance\":5}",
        ))
        .unwrap();
        assert_eq!(global.data_dir, Some(PathBuf::from("/tmp/x")));
        assert_eq!(
            command,
            Command::Deploy {
                code: PathBuf::from("c.js"),
                name: "Greeter".to_string(),
                owner: Address::new("0xA"),
                init: Some(json!({"balance": 5})),
            }
        );
    }

    #[test]
    fn test_parse_execute_defaults() {
        let (_, command) = parse_args(&args("execute 0xC greet --sender 0xA")).unwrap();
        assert_eq!(
            command,
            Command::Execute {
                id: Address::new("0xC"),
                method: "greet".to_string(),
                params: json!({}),
                sender: Address::new("0xA"),
                value: 0,
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args("")).is_err());
        assert!(parse_args(&args("explode")).is_err());
        assert!(parse_args(&args("transfer 0xC --to 0xB --sender 0xA")).is_err());
        assert!(parse_args(&args("transfer 0xC --to 0xB --amount -1 --sender 0xA")).is_err());
        assert!(parse_args(&args("execute 0xC greet --sender 0xA --params {bad")).is_err());
        assert!(parse_args(&args("list --bogus")).is_err());
        assert!(parse_args(&args("info")).is_err());
    }

    #[test]
    fn test_parse_list_and_init() {
        let (_, command) = parse_args(&args("list --owner 0xA")).unwrap();
        assert_eq!(
            command,
            Command::List {
                owner: Some(Address::new("0xA"))
            }
        );
        let (_, command) = parse_args(&args("init-config --force")).unwrap();
        assert_eq!(command, Command::InitConfig { force: true });
    }
}
