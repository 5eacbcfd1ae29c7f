use clap::Parser;
use logoscope::Opts;
use logoscope::cli::SubCommandExtend;
use logoscope::config::SubCommand;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();
    match &opts.subcmd {
        SubCommand::Server(cmd) => cmd.run(&opts).await,
        SubCommand::Train(cmd) => cmd.run(&opts).await,
        SubCommand::Predict(cmd) => cmd.run(&opts).await,
        SubCommand::Feedback(cmd) => cmd.run(&opts).await,
        SubCommand::Tune(cmd) => cmd.run(&opts).await,
        SubCommand::Show(cmd) => cmd.run(&opts).await,
    }
}
