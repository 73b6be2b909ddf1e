use anyhow::Result;

fn main() -> Result<()> {
    statemgr::cli::run()
}
