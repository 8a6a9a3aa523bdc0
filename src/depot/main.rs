//! Depot CLI: runs the server daemon, the out-of-band cache build job,
//! and the client-side operations against a working tree.

#[macro_use]
extern crate tracing;

mod cli;

use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
	name = "depot",
	about = "Versioned, content-addressed file service for large project trees"
)]
struct Opt {
	#[structopt(subcommand)]
	cmd: cli::Command,
}

#[tokio::main]
async fn main() {
	if std::env::var("RUST_LOG").is_err() {
		std::env::set_var("RUST_LOG", "depot=info,depot_server=info,depot_client=info");
	}
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	let opt = Opt::from_args();
	if let Err(e) = cli::run(opt.cmd).await {
		error!("{}", e);
		std::process::exit(1);
	}
}
