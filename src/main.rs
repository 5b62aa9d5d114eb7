use anyhow::Result;

fn main() -> Result<()> {
    // .env is a development convenience; real deployments set the
    // environment directly. Missing files are fine.
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    dioxus::launch(detour::ui::App);
    Ok(())
}
