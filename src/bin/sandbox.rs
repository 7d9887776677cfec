use anyhow::Result;

fn main() -> Result<()> {
    let code = sandbox::cli::run()?;
    std::process::exit(code)
}
