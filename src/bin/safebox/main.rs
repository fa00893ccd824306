use anyhow::Result;
use env_logger::{Builder, Env};
use log::error;

mod cli;
mod util;
mod cmd_put;
mod cmd_get;
mod cmd_del;
mod cmd_list;
mod cmd_clear;
mod cmd_status;
mod cmd_journal;

fn init_logger() {
    // Уровень берём из RUST_LOG, иначе дефолт - warn (CLI печатает результат в stdout).
    Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();
    if let Err(e) = run() {
        error!("{:?}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = <cli::Cli as clap::Parser>::parse();
    match cli.cmd {
        cli::Cmd::Put { path, name, key, value } =>
            cmd_put::exec(path, name, key, value),

        cli::Cmd::Get { path, name, key } =>
            cmd_get::exec(path, name, key),

        cli::Cmd::Del { path, name, keys } =>
            cmd_del::exec(path, name, keys),

        cli::Cmd::List { path, name, json } =>
            cmd_list::exec(path, name, json),

        cli::Cmd::Clear { path, name } =>
            cmd_clear::exec(path, name),

        cli::Cmd::Status { path, name, json } =>
            cmd_status::exec(path, name, json),

        cli::Cmd::Journal { path, json } =>
            cmd_journal::exec(path, json),
    }
}
