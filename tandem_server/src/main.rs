//! Tandem participant server node executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{self, LevelFilter};
use tandem::{
    bind_with_retry, logger_init, pf_error, pf_info, pf_warn, serve,
    ConnHandler, KvServer, ServerConfig, TandemError, TxnParticipant,
    WorkerPool,
};
use tokio::fs;
use tokio::runtime::Builder;
use tokio::sync::watch;
use tokio::time::{self, Duration};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Participant ID; may be any 64-bit value, written signed or unsigned.
    #[arg(short, long, allow_negative_numbers = true)]
    id: i64,

    /// Local IP to use for binding the listening socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Transaction/read service port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52710)]
    port: u16,

    /// Hostname to advertise to the master at registration.
    #[arg(long, default_value_t = String::from("localhost"))]
    host: String,

    /// Master registration address.
    #[arg(short, long, default_value_t = String::from("localhost:52701"))]
    master: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 16)]
    threads: usize,

    /// Server configuration in TOML format string.
    #[arg(long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(TandemError)` on any error.
    fn sanitize(&self) -> Result<(), TandemError> {
        if self.port <= 1024 {
            Err(TandemError::msg(format!("invalid port {}", self.port)))
        } else if self.host.is_empty()
            || !self
                .host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            Err(TandemError::msg(format!("invalid host '{}'", self.host)))
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

/// Actual main function of the participant node.
fn server_main() -> Result<(), TandemError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let config = ServerConfig::parse(args.config.as_deref())?;
    let id = args.id as u64;
    let timeout = Duration::from_millis(config.timeout_ms);

    let listen_addr: SocketAddr =
        format!("{}:{}", args.bind_ip, args.port).parse()?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!(id; "error sending to term channel: {}", e);
        }
    })
    .map_err(|e| TandemError::msg(e.to_string()))?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-server")
            .build()?;

        // enter tokio runtime, restore local state, register with the
        // master, and serve until terminated
        runtime.block_on(async move {
            let kv =
                Arc::new(KvServer::new(config.cache_sets, config.cache_ways));
            if !config.snapshot_path.is_empty()
                && fs::try_exists(&config.snapshot_path).await?
            {
                kv.store()
                    .restore_from_file(Path::new(&config.snapshot_path))
                    .await?;
                pf_info!(id; "restored snapshot '{}'", config.snapshot_path);
            }

            let participant = Arc::new(
                TxnParticipant::new_and_recover(
                    id,
                    kv.clone(),
                    Path::new(&config.wal_path),
                )
                .await?,
            );

            // bind before registering, so the master can reach me the
            // moment registration completes
            let listener = bind_with_retry(listen_addr, 10).await?;

            let mut attempt = 0;
            while let Err(e) = participant
                .register_with_master(
                    &args.master,
                    &args.host,
                    args.port,
                    timeout,
                )
                .await
            {
                attempt += 1;
                pf_warn!(id; "registration attempt {} failed: {}",
                             attempt, e);
                time::sleep(timeout).await;
            }

            let pool =
                Arc::new(WorkerPool::new(format!("p{}", id), config.workers));
            let handler: Arc<dyn ConnHandler> = participant.clone();
            serve("p", listener, handler, pool, rx_term).await?;

            pf_warn!(id; "server caught termination signal");
            if !config.snapshot_path.is_empty() {
                participant
                    .kv()
                    .store()
                    .dump_to_file(Path::new(&config.snapshot_path))
                    .await?;
                pf_info!(id; "dumped snapshot '{}'", config.snapshot_path);
            }

            // suppress logging before dropping the runtime to avoid
            // spurious error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), TandemError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the participant node executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("s"; "server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn valid_args() -> CliArgs {
        CliArgs {
            id: -1,
            bind_ip: Ipv4Addr::UNSPECIFIED,
            port: 40710,
            host: "localhost".into(),
            master: "localhost:40701".into(),
            threads: 2,
            config: None,
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), TandemError> {
        valid_args().sanitize()
    }

    #[test]
    fn sanitize_invalid_port() {
        let mut args = valid_args();
        args.port = 1023;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_host() {
        let mut args = valid_args();
        args.host = "bad_host!".into();
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let mut args = valid_args();
        args.threads = 1;
        assert!(args.sanitize().is_err());
    }
}
