#[macro_use]
extern crate log;

use dotenv::dotenv;
use log::LevelFilter;
use poem::{
    listener::TcpListener,
    middleware::{AddData, Cors, SizeLimit},
    EndpointExt, Route, Server,
};
use poem_openapi::OpenApiService;
use societyhub::api::ratelimit::{RateLimit, DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW};
use societyhub::api::route::SocietyHubApi;
use societyhub::{connect_db, init_logger, AppConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;

const DEFAULT_CORS_ORIGINS: [&str; 3] = [
    "http://localhost:5173",
    "http://localhost:8081",
    "http://localhost:3000",
];

/// Request bodies larger than 10 MiB are refused.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// SocietyHub backend server.
#[derive(Debug, PartialEq, StructOpt)]
#[structopt(setting=structopt::clap::AppSettings::ColoredHelp, name="societyhub", author="SocietyHub Contributors")]
struct Opt {
    /// Activate debug mode
    /// short and long flags (--debug) will be deduced from the field's name
    #[structopt(name = "debug", long = "debug")]
    debug: bool,

    /// Activate openapi mode
    #[structopt(name = "openapi", short = "o", long = "openapi")]
    openapi: bool,

    /// Enable CORS support for the frontend origins.
    #[structopt(name = "cors", short = "c", long = "cors")]
    cors: bool,

    /// Allowed CORS origins, separated by comma. The local development servers of the frontend by default.
    #[structopt(name = "cors-origins", long = "cors-origins")]
    cors_origins: Option<String>,

    /// 127.0.0.1 or 0.0.0.0
    #[structopt(name = "host", short = "H", long = "host", possible_values=&["127.0.0.1", "0.0.0.0"], default_value = "127.0.0.1")]
    host: String,

    /// Which port.
    #[structopt(name = "port", short = "p", long = "port", default_value = "5000")]
    port: String,

    /// Database url, such as postgres:://user:pass@host:port/dbname.
    /// You can also set it with env var: DATABASE_URL.
    #[structopt(name = "database-url", short = "d", long = "database-url")]
    database_url: Option<String>,

    /// Pool size for database connection.
    #[structopt(name = "pool-size", short = "s", long = "pool-size")]
    pool_size: Option<u32>,

    /// JWT secret key which signs the bearer tokens.
    /// You can also set it with env var: JWT_SECRET_KEY. The server refuses to start without it.
    #[structopt(name = "jwt-secret-key", short = "k", long = "jwt-secret-key")]
    jwt_secret_key: Option<String>,

    /// Directory of the python agents (categoryagent.py and billingagent.py).
    /// You can also set it with env var: SOCIETYHUB_AGENTS_DIR. The built-in matcher and duplicate detector are used without it.
    #[structopt(name = "agents-dir", short = "a", long = "agents-dir", parse(from_os_str))]
    agents_dir: Option<PathBuf>,

    /// The python interpreter which runs the agents.
    /// You can also set it with env var: SOCIETYHUB_PYTHON.
    #[structopt(name = "python", long = "python")]
    python: Option<String>,

    /// The CSV export of bills which the billing agent analyses.
    /// You can also set it with env var: SOCIETYHUB_BILLING_CSV.
    #[structopt(name = "billing-csv", short = "b", long = "billing-csv", parse(from_os_str))]
    billing_csv: Option<PathBuf>,

    /// Seconds an agent may run before it is killed.
    #[structopt(name = "agent-timeout", short = "t", long = "agent-timeout", default_value = "60")]
    agent_timeout: u64,

    /// Requests a client may send within 15 minutes.
    #[structopt(name = "rate-limit", short = "r", long = "rate-limit")]
    rate_limit: Option<u32>,
}

/// The value of the option, otherwise the non-empty value of the environment variable.
fn option_or_env(value: Option<String>, key: &str) -> Option<String> {
    match value {
        Some(v) => Some(v),
        None => match std::env::var(key) {
            Ok(v) if !v.is_empty() => Some(v),
            _ => None,
        },
    }
}

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    dotenv().ok();

    let args = Opt::from_args();

    let log_result = if args.debug {
        init_logger("societyhub", LevelFilter::Debug)
    } else {
        init_logger("societyhub", LevelFilter::Info)
    };

    if let Err(log) = log_result {
        error!(target:"stdout", "Log initialization error, {}", log);
        std::process::exit(1);
    };

    let host = args.host;
    let port = args.port;

    println!("\n\t\t*** Launch societyhub on {}:{} ***", host, port);

    let jwt_secret = match option_or_env(args.jwt_secret_key, "JWT_SECRET_KEY") {
        Some(v) => v,
        None => {
            error!("{}", "JWT_SECRET_KEY is not set.");
            std::process::exit(1);
        }
    };

    let mut config = AppConfig::new(&jwt_secret);
    config.agents_dir = args.agents_dir.or_else(|| {
        option_or_env(None, "SOCIETYHUB_AGENTS_DIR").map(PathBuf::from)
    });
    if let Some(python) = option_or_env(args.python, "SOCIETYHUB_PYTHON") {
        config.python = python;
    }
    config.billing_csv = args.billing_csv.or_else(|| {
        option_or_env(None, "SOCIETYHUB_BILLING_CSV").map(PathBuf::from)
    });
    config.agent_timeout = Duration::from_secs(args.agent_timeout);

    match &config.agents_dir {
        Some(dir) => info!("Agents are run from {} with {}.", dir.display(), config.python),
        None => warn!("No agents directory is set, the built-in matcher and duplicate detector are used. If you need the python agents, please use `--agents-dir`."),
    }
    if config.billing_csv.is_none() {
        warn!("No billing export is set, the billing agent has nothing to analyse. Please use `--billing-csv`.");
    }

    // Connect to database.
    let database_url = match option_or_env(args.database_url, "DATABASE_URL") {
        Some(v) => v,
        None => {
            error!("{}", "DATABASE_URL is not set.");
            std::process::exit(1);
        }
    };

    let pool_size = args.pool_size.unwrap_or(10);
    let pool = match connect_db(&database_url, pool_size).await {
        Ok(pool) => pool,
        Err(err) => {
            error!("Connect to database failed, {}", err);
            std::process::exit(1);
        }
    };
    let shared_pool = AddData::new(Arc::new(pool));
    let shared_config = AddData::new(Arc::new(config));

    let api_service = OpenApiService::new(SocietyHubApi, "SocietyHub", "v0.1.0")
        .summary("A RESTful API Service for SocietyHub.")
        .description("Residents, bills, maintenance issues and the agents which assist a residential society.")
        .server(format!("http://{}:{}", host, port));
    let openapi = api_service.swagger_ui();
    let spec = api_service.spec();

    let route = Route::new();

    let route = if args.openapi {
        info!("OpenApi mode is enabled. You can access the OpenApi spec at /openapi.");
        route
            .nest("/openapi", openapi)
            .at("/spec", poem::endpoint::make_sync(move |_| spec.clone()))
    } else {
        warn!("OpenApi mode is disabled. If you need the OpenApi, please use `--openapi` flag.");
        route
    };

    let rate_limit = args.rate_limit.unwrap_or(DEFAULT_MAX_REQUESTS);
    info!("Each client may send {} requests per {:?}.", rate_limit, DEFAULT_WINDOW);

    let route = route
        .nest_no_strip("/api", api_service)
        .with(shared_pool)
        .with(shared_config)
        .with(SizeLimit::new(MAX_BODY_SIZE))
        .with(RateLimit::new(rate_limit, DEFAULT_WINDOW));

    if args.cors {
        let origins = match &args.cors_origins {
            Some(origins) => origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect::<Vec<String>>(),
            None => DEFAULT_CORS_ORIGINS.iter().map(|o| o.to_string()).collect(),
        };
        info!("CORS mode is enabled for {:?}.", origins);
        let route = route.with(Cors::new().allow_origins(origins).allow_credentials(true));
        Server::new(TcpListener::bind(format!("{}:{}", host, port)))
            .run(route)
            .await
    } else {
        warn!("CORS mode is disabled. If you need the CORS, please use `--cors` flag.");
        Server::new(TcpListener::bind(format!("{}:{}", host, port)))
            .run(route)
            .await
    }
}
