use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use cryptobot_api::api::{EngineClient, GatewayConnector};
use cryptobot_api::config::Settings;
use cryptobot_api::contract::{ContractForm, StopLossForm, TriggerForm};
use cryptobot_api::control::{ContractInput, CreateStrategy, EditStrategy, RiskUpdate};
use cryptobot_api::db::{PostgresStore, StrategyStore};
use cryptobot_api::exchange::{ExchangeConnector, PaperConnector, PaperExchange};
use cryptobot_api::lock::{ActionLock, LocalActionLock, RedisActionLock};
use cryptobot_api::{ControlError, Operator, Side, StrategyController};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "cryptobot-api",
    about = "Control plane for engine-managed futures strategies"
)]
struct Cli {
    /// Account the action is performed for
    #[arg(long, global = true)]
    owner: Option<Uuid>,

    /// Allow admin-only commands
    #[arg(long, global = true, default_value_t = false)]
    admin: bool,

    /// Use the local paper exchange instead of the gateway
    #[arg(long, global = true, default_value_t = false)]
    paper: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List strategies with live trigger prices.
    List,
    /// Show one strategy with its stored params and order details.
    Show { uuid: Uuid },
    /// Show collateral and margin of the default exchange account.
    Account,
    /// Create a disabled strategy.
    Create(CreateArgs),
    /// Change margin or comment of a paused, closed strategy.
    Edit {
        uuid: Uuid,
        #[arg(long)]
        margin: Option<String>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Delete a paused, closed strategy.
    Delete { uuid: Uuid },
    /// Hand the strategy to the engine.
    Enable { uuid: Uuid },
    /// Take the strategy away from the engine.
    Disable { uuid: Uuid },
    /// Mark the strategy closed after checking the exchange by hand.
    Reset { uuid: Uuid },
    /// Close the open position and cancel its stop order.
    ClosePosition { uuid: Uuid },
    /// Change stop-loss and take-profit.
    Tpsl(TpslArgs),
    /// Raw answers of the engine's diagnostic endpoints (admin).
    Engine,
}

#[derive(Clone, Copy, ValueEnum)]
enum SideArg {
    Long,
    Short,
}

impl From<SideArg> for Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Long => Side::Long,
            SideArg::Short => Side::Short,
        }
    }
}

#[derive(Args)]
struct CreateArgs {
    #[arg(long)]
    symbol: String,

    #[arg(long, value_enum)]
    side: SideArg,

    #[arg(long)]
    margin: String,

    #[arg(long, default_value = "")]
    comment: String,

    /// Params as a JSON document; replaces the entry/stop-loss/take-profit flags.
    #[arg(long)]
    params: Option<PathBuf>,

    /// limit or trendline
    #[arg(long, default_value = "limit")]
    entry_type: String,

    /// Comparison for the entry trigger (<= or >=)
    #[arg(long, default_value = "<=")]
    entry_operator: String,

    #[arg(long)]
    entry_price: Option<String>,

    /// Trendline anchors, `YYYY-MM-DD HH:MM` UTC.
    #[arg(long)]
    time_1: Option<String>,
    #[arg(long)]
    price_1: Option<String>,
    #[arg(long)]
    time_2: Option<String>,
    #[arg(long)]
    price_2: Option<String>,

    /// Percent added to the trendline price.
    #[arg(long)]
    offset_percent: Option<String>,

    #[arg(long, default_value_t = false)]
    flip_operator: bool,

    #[arg(long)]
    sl_operator: Option<String>,
    #[arg(long)]
    sl_price: Option<String>,

    /// Trendline stop-loss distance from the fill, in percent.
    #[arg(long)]
    sl_tolerance_percent: Option<String>,

    #[arg(long, default_value_t = false)]
    sl_readjust: bool,

    #[arg(long)]
    tp_operator: Option<String>,
    #[arg(long)]
    tp_price: Option<String>,
}

#[derive(Args)]
struct TpslArgs {
    uuid: Uuid,
    #[arg(long)]
    sl_operator: Option<String>,
    #[arg(long)]
    sl_price: Option<String>,
    #[arg(long)]
    tp_operator: Option<String>,
    #[arg(long)]
    tp_price: Option<String>,
    #[arg(long)]
    comment: Option<String>,
}

/// Both flags or neither
fn trigger_form(label: &str, operator: Option<String>, price: Option<String>) -> anyhow::Result<Option<TriggerForm>> {
    match (operator, price) {
        (Some(operator), Some(price)) => Ok(Some(TriggerForm { operator, price })),
        (None, None) => Ok(None),
        _ => bail!("{} needs both an operator and a price", label),
    }
}

impl CreateArgs {
    fn contract(&self) -> anyhow::Result<ContractInput> {
        if let Some(path) = &self.params {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let document = serde_json::from_str(&content).context("params file is not valid JSON")?;
            return Ok(ContractInput::Document(document));
        }

        let stop_trigger = trigger_form("stop-loss", self.sl_operator.clone(), self.sl_price.clone())?;
        let stop_loss = if stop_trigger.is_some() || self.sl_tolerance_percent.is_some() {
            Some(StopLossForm {
                trigger: stop_trigger,
                loss_tolerance_percent: self.sl_tolerance_percent.clone(),
                trendline_readjustment_enabled: self.sl_readjust,
            })
        } else {
            None
        };

        Ok(ContractInput::Form(ContractForm {
            entry_type: self.entry_type.clone(),
            entry_operator: self.entry_operator.clone(),
            entry_price: self.entry_price.clone(),
            time_1: self.time_1.clone(),
            price_1: self.price_1.clone(),
            time_2: self.time_2.clone(),
            price_2: self.price_2.clone(),
            trendline_offset_percent: self.offset_percent.clone(),
            flip_operator_enabled: self.flip_operator,
            stop_loss,
            take_profit: trigger_form("take-profit", self.tp_operator.clone(), self.tp_price.clone())?,
        }))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    setup_logging(&settings.log_filter);

    match run(cli, settings).await {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Only the operator-safe text leaves the process; details stay in the log
fn public(err: ControlError) -> anyhow::Error {
    if err.is_operator_error() {
        tracing::warn!("action refused: {}", err);
    } else {
        tracing::error!("action failed: {}", err);
    }
    anyhow!(err.public_message())
}

fn pretty<T: Serialize>(value: &T) -> anyhow::Result<String> {
    serde_json::to_string_pretty(value).context("failed to serialize output")
}

async fn run(cli: Cli, settings: Settings) -> anyhow::Result<String> {
    let owner = cli.owner.context("--owner is required")?;
    let operator = Operator {
        uuid: owner,
        is_admin: cli.admin,
    };

    let store: Arc<dyn StrategyStore> = Arc::new(
        PostgresStore::new(&settings.database_url)
            .await
            .context("failed to connect to Postgres")?,
    );
    let engine = Arc::new(EngineClient::new(
        &settings.engine.url,
        settings.engine.timeout(),
        settings.engine.requests_per_second,
    )?);

    let lock: Arc<dyn ActionLock> = match &settings.redis_url {
        Some(url) => Arc::new(
            RedisActionLock::new(url, settings.lock_ttl())
                .await
                .map_err(|e| anyhow!("failed to connect to Redis: {}", e))?,
        ),
        None => {
            tracing::warn!("redis_url not set, actions are only serialized within this process");
            Arc::new(LocalActionLock::new())
        }
    };

    let paper = if cli.paper {
        let exchange = PaperExchange::load(settings.exchange.name.clone(), &settings.exchange.paper_state)
            .map_err(|e| anyhow!("failed to load paper exchange: {}", e))?;
        Some(Arc::new(exchange))
    } else {
        None
    };
    let exchanges: Arc<dyn ExchangeConnector> = match &paper {
        Some(exchange) => Arc::new(PaperConnector::new(exchange.clone())),
        None => Arc::new(
            GatewayConnector::new(
                &settings.exchange.gateway_url,
                std::time::Duration::from_secs(settings.exchange.timeout_secs),
            )
            .map_err(|e| anyhow!("failed to build exchange client: {}", e))?,
        ),
    };

    let controller = StrategyController::new(store, engine, exchanges, lock, settings.control());
    let output = execute(&controller, &operator, cli.command).await?;

    if let Some(exchange) = paper {
        exchange
            .save(&settings.exchange.paper_state)
            .await
            .map_err(|e| anyhow!("failed to save paper exchange: {}", e))?;
    }
    Ok(output)
}

async fn execute(controller: &StrategyController, operator: &Operator, command: Commands) -> anyhow::Result<String> {
    match command {
        Commands::List => pretty(&controller.list(operator).await.map_err(public)?),
        Commands::Show { uuid } => pretty(&controller.show(operator, uuid).await.map_err(public)?),
        Commands::Account => pretty(&controller.account(operator).await.map_err(public)?),
        Commands::Create(args) => {
            let request = CreateStrategy {
                symbol: args.symbol.clone(),
                side: args.side.into(),
                margin: args.margin.clone(),
                contract: args.contract()?,
                comment: args.comment.clone(),
            };
            pretty(&controller.create(operator, request).await.map_err(public)?)
        }
        Commands::Edit { uuid, margin, comment } => {
            let request = EditStrategy { margin, comment };
            pretty(&controller.edit(operator, uuid, request).await.map_err(public)?)
        }
        Commands::Delete { uuid } => {
            controller.delete(operator, uuid).await.map_err(public)?;
            pretty(&serde_json::json!({ "deleted": uuid }))
        }
        Commands::Enable { uuid } => pretty(&controller.enable(operator, uuid).await.map_err(public)?),
        Commands::Disable { uuid } => pretty(&controller.disable(operator, uuid).await.map_err(public)?),
        Commands::Reset { uuid } => pretty(&controller.reset(operator, uuid).await.map_err(public)?),
        Commands::ClosePosition { uuid } => {
            pretty(&controller.close_position(operator, uuid).await.map_err(public)?)
        }
        Commands::Tpsl(args) => {
            let update = RiskUpdate {
                stop_loss: trigger_form("stop-loss", args.sl_operator, args.sl_price)?,
                take_profit: trigger_form("take-profit", args.tp_operator, args.tp_price)?,
                comment: args.comment,
            };
            pretty(&controller.update_risk(operator, args.uuid, update).await.map_err(public)?)
        }
        Commands::Engine => pretty(&controller.engine_diagnostics(operator).await.map_err(public)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use cryptobot_api::contract::Operator;
    use std::str::FromStr;

    #[test]
    fn test_entry_operator_help_lists_accepted_operators() {
        let command = Cli::command();
        let create = command.find_subcommand("create").unwrap();
        let help = create
            .get_arguments()
            .find(|arg| arg.get_id().as_str() == "entry_operator")
            .and_then(|arg| arg.get_help())
            .unwrap()
            .to_string();

        assert!(help.contains("(<= or >=)"));
        for accepted in ["<=", ">="] {
            assert!(Operator::from_str(accepted).is_ok());
        }
        for refused in ["<", ">"] {
            assert!(Operator::from_str(refused).is_err());
        }
    }
}
