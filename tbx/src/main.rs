use anyhow::Result;

mod cli;
mod hidapi_impl;

fn main() -> Result<()> {
    cli::execute()
}
