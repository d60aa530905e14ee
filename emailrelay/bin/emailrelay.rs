#[cfg(not(unix))]
compile_error!("Only unix is currently supported");

use emailrelay::{Config, Emailrelay};
use emailrelay_common::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = Config::load()?;
    Emailrelay::new(config).run().await
}
