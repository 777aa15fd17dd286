//! Tandem master coordinator node executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{self, LevelFilter};
use tandem::{
    bind_with_retry, logger_init, pf_error, pf_warn, serve, ClientApiHandler,
    ConnHandler, Coordinator, MasterConfig, RegistrationHandler, ReplicaRing,
    TandemError, WorkerPool,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening sockets.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Client-facing API port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52700)]
    cli_port: u16,

    /// Participant registration port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52701)]
    reg_port: u16,

    /// Number of participant servers expected to register.
    #[arg(short = 'n', long, default_value_t = 2)]
    population: u8,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 16)]
    threads: usize,

    /// Master configuration in TOML format string.
    #[arg(long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(TandemError)` on any error.
    fn sanitize(&self) -> Result<(), TandemError> {
        if self.cli_port <= 1024 {
            Err(TandemError::msg(format!(
                "invalid cli_port {}",
                self.cli_port
            )))
        } else if self.reg_port <= 1024 {
            Err(TandemError::msg(format!(
                "invalid reg_port {}",
                self.reg_port
            )))
        } else if self.cli_port == self.reg_port {
            Err(TandemError::msg(format!(
                "cli_port == reg_port {}",
                self.cli_port
            )))
        } else if self.population == 0 {
            Err(TandemError::msg(format!(
                "invalid population {}",
                self.population
            )))
        } else if self.threads < 2 {
            Err(TandemError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of the master node.
fn master_main() -> Result<(), TandemError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let config = MasterConfig::parse(args.config.as_deref())?;

    let cli_addr: SocketAddr =
        format!("{}:{}", args.bind_ip, args.cli_port).parse()?;
    let reg_addr: SocketAddr =
        format!("{}:{}", args.bind_ip, args.reg_port).parse()?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("m"; "error sending to term channel: {}", e);
        }
    })
    .map_err(|e| TandemError::msg(e.to_string()))?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-master")
            .build()?;

        // enter tokio runtime, set up the coordinator and both listeners,
        // and serve until terminated
        runtime.block_on(async move {
            let ring =
                Arc::new(ReplicaRing::new(args.population as usize));
            let coord = Arc::new(Coordinator::new(ring.clone(), &config));

            let cli_listener = bind_with_retry(cli_addr, 10).await?;
            let reg_listener = bind_with_retry(reg_addr, 10).await?;

            let api_pool =
                Arc::new(WorkerPool::new("m-api", config.api_workers));
            let reg_pool =
                Arc::new(WorkerPool::new("m-reg", config.reg_workers));
            let api_handler: Arc<dyn ConnHandler> =
                Arc::new(ClientApiHandler::new(coord));
            let reg_handler: Arc<dyn ConnHandler> =
                Arc::new(RegistrationHandler::new(ring));

            let api_serve = serve(
                "m-api",
                cli_listener,
                api_handler,
                api_pool,
                rx_term.clone(),
            );
            let reg_serve =
                serve("m-reg", reg_listener, reg_handler, reg_pool, rx_term);
            tokio::try_join!(api_serve, reg_serve)?;

            pf_warn!("m"; "master caught termination signal");

            // suppress logging before dropping the runtime to avoid
            // spurious error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), TandemError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the master node executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = master_main() {
        pf_error!("m"; "master_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
