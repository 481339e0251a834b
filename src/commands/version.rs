use anyhow::Result;

pub fn run() -> Result<()> {
    println!("kive {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
