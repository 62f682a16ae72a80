use clap::Parser;
use std::process;
use stratus::cli::{print_err, run, Cli};
use stratus::err::EXIT_CANCELLED;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;

pub fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    stratus::logging::init(cli.verbose)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        // the first interrupt lets in flight launches settle, the second one exits
        ctrlc::set_handler(move || {
            if cancel.is_cancelled() {
                process::exit(EXIT_CANCELLED);
            }
            cancel.cancel();
        })?;
    }

    let runtime = Builder::new_multi_thread().enable_all().build()?;
    match runtime.block_on(async move { run(cli, cancel).await }) {
        Ok(_) => Ok(()),
        Err(err) => {
            print_err(&err);
            process::exit(err.exit_code());
        }
    }
}
