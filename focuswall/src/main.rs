mod command;
mod enforce;
mod monitor;
mod resolver;
mod storage;
mod system;
mod utils;
use clap::Parser;
use command::{run, Options};

fn main() -> Result<(), anyhow::Error> {
    // Parse command line arguments
    let options = Options::parse();

    // Run main program
    run(options)?;

    Ok(())
}
