//! Tandem command-line client executable: one-shot get/put/del against a
//! running cluster.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tandem::{logger_init, pf_error, KvClient, TandemError};
use tokio::runtime::Builder;
use tokio::time::Duration;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Master client-API address.
    #[arg(short, long, default_value_t = String::from("localhost:52700"))]
    master: String,

    /// Per-call timeout in millisecs.
    #[arg(short, long, default_value_t = 3000)]
    timeout_ms: u64,

    #[command(subcommand)]
    op: Op,
}

/// Operation to run against the cluster.
#[derive(Subcommand, Debug)]
enum Op {
    /// Read the value of a key.
    Get { key: String },

    /// Write a value into a key.
    Put { key: String, value: String },

    /// Delete a key.
    Del { key: String },
}

impl CliArgs {
    /// Sanitize command line arguments.
    fn sanitize(&self) -> Result<(), TandemError> {
        if self.master.is_empty() {
            Err(TandemError::msg("empty master address"))
        } else if self.timeout_ms == 0 {
            Err(TandemError::msg(format!(
                "invalid timeout_ms {}",
                self.timeout_ms
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of the client.
fn client_main() -> Result<(), TandemError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    let client = KvClient::new(
        args.master.clone(),
        Duration::from_millis(args.timeout_ms),
    );

    // create tokio runtime and run the one-shot operation
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("tokio-worker-client")
        .build()?;

    runtime.block_on(async move {
        match args.op {
            Op::Get { key } => {
                let value = client.get(&key).await?;
                println!("{}", value);
            }
            Op::Put { key, value } => {
                client.put(&key, &value).await?;
                println!("ok");
            }
            Op::Del { key } => {
                client.del(&key).await?;
                println!("ok");
            }
        }
        Ok::<(), TandemError>(())
    })
}

/// Main function of the client executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("c"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
