use anyhow::Result;

#[cfg(target_os = "linux")]
mod cli;

#[cfg(target_os = "linux")]
fn main() -> Result<()> {
    cli::execute()
}

#[cfg(not(target_os = "linux"))]
fn main() -> Result<()> {
    anyhow::bail!("hidpp-tool talks to hidraw nodes and only runs on Linux")
}
