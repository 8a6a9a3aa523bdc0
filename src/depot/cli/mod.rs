//! Subcommands of the depot binary.

use std::path::PathBuf;

use structopt::StructOpt;
use tokio::net::TcpListener;

use depot_client::{cache::CacheDir, rebuild, workdir, Client};
use depot_db::Pool;
use depot_rpc::ObjectQuery;
use depot_server::{cache, service, Depot};
use depot_util::config;
use depot_util::data::VERSION_NO_CHANGE;
use depot_util::error::Error;

#[derive(StructOpt, Debug)]
pub enum Command {
	/// Run the depot server
	Server {
		/// Path to the configuration file
		#[structopt(short = "c", long = "config", default_value = "/etc/depot.toml")]
		config: PathBuf,
	},

	/// Scan the object index and publish a new cache version
	CacheBuild {
		#[structopt(short = "c", long = "config", default_value = "/etc/depot.toml")]
		config: PathBuf,
	},

	/// Create a project
	NewProject {
		#[structopt(short = "s", long = "server")]
		server: String,
		#[structopt(long = "project")]
		project: i64,
		/// Directory globs stored as packed subtrees (e.g. node_modules/)
		#[structopt(long = "pattern")]
		patterns: Vec<String>,
		/// Clone this project as a template
		#[structopt(long = "template")]
		template: Option<i64>,
		/// Template version to clone (defaults to its latest)
		#[structopt(long = "template-version")]
		template_version: Option<i64>,
	},

	/// Delete a project and all of its history
	DeleteProject {
		#[structopt(short = "s", long = "server")]
		server: String,
		#[structopt(long = "project")]
		project: i64,
	},

	/// List projects with their latest versions
	ListProjects {
		#[structopt(short = "s", long = "server")]
		server: String,
	},

	/// Diff a working tree against its manifest and push the changes
	Update {
		#[structopt(short = "s", long = "server")]
		server: String,
		#[structopt(long = "project")]
		project: i64,
		#[structopt(long = "dir", default_value = ".")]
		dir: PathBuf,
		/// Restrict the diff to these path prefixes
		#[structopt(long = "subpath")]
		subpaths: Vec<String>,
	},

	/// Materialize a project version into a working tree
	Rebuild {
		#[structopt(short = "s", long = "server")]
		server: String,
		#[structopt(long = "project")]
		project: i64,
		#[structopt(long = "dir", default_value = ".")]
		dir: PathBuf,
		/// Target version (defaults to latest)
		#[structopt(long = "to")]
		to: Option<i64>,
		/// Local cache of packed subtrees
		#[structopt(long = "cache-dir")]
		cache_dir: Option<PathBuf>,
		/// Restrict the rebuild to these path prefixes
		#[structopt(long = "subpath")]
		subpaths: Vec<String>,
	},

	/// List objects of a project version
	Get {
		#[structopt(short = "s", long = "server")]
		server: String,
		#[structopt(long = "project")]
		project: i64,
		/// Path to fetch; empty for the whole tree
		#[structopt(long = "path", default_value = "")]
		path: String,
		/// Treat the path as a prefix
		#[structopt(long = "prefix")]
		prefix: bool,
		#[structopt(long = "from", default_value = "0")]
		from: i64,
		#[structopt(long = "to")]
		to: Option<i64>,
	},

	/// Show a project's latest version and live object statistics
	Inspect {
		#[structopt(short = "s", long = "server")]
		server: String,
		#[structopt(long = "project")]
		project: i64,
	},

	/// Roll a project back to an older version
	Rollback {
		#[structopt(short = "s", long = "server")]
		server: String,
		#[structopt(long = "project")]
		project: i64,
		#[structopt(long = "version")]
		version: i64,
	},

	/// Print the (project, latest_version) pairs of all projects
	Snapshot {
		#[structopt(short = "s", long = "server")]
		server: String,
	},

	/// Restore a snapshot; projects not listed are deleted
	Reset {
		#[structopt(short = "s", long = "server")]
		server: String,
		/// Pairs in id=version form
		#[structopt(name = "projects")]
		projects: Vec<String>,
	},

	/// Copy a project version into a fresh project
	CloneProject {
		#[structopt(short = "s", long = "server")]
		server: String,
		#[structopt(long = "source")]
		source: i64,
		#[structopt(long = "version")]
		version: i64,
		#[structopt(long = "target")]
		target: i64,
	},

	/// Garbage collection
	Gc(GcCommand),

	/// Mirror a server cache version into a local cache directory
	PopulateCache {
		#[structopt(short = "s", long = "server")]
		server: String,
		#[structopt(long = "cache-dir")]
		cache_dir: PathBuf,
		/// Cache version to install (defaults to latest)
		#[structopt(long = "version")]
		version: Option<i64>,
	},
}

#[derive(StructOpt, Debug)]
pub enum GcCommand {
	/// Keep only the last N versions of one project
	Project {
		#[structopt(short = "s", long = "server")]
		server: String,
		#[structopt(long = "project")]
		project: i64,
		#[structopt(long = "keep")]
		keep: i64,
	},
	/// Keep only the last N versions of a random sample of projects
	RandomProjects {
		#[structopt(short = "s", long = "server")]
		server: String,
		#[structopt(long = "count")]
		count: i64,
		#[structopt(long = "keep")]
		keep: i64,
	},
	/// Drop contents no object references any more
	Contents {
		#[structopt(short = "s", long = "server")]
		server: String,
	},
}

pub async fn run(cmd: Command) -> Result<(), Error> {
	match cmd {
		Command::Server { config } => {
			let config = config::read_config(&config)?;
			let pool = Pool::open(&config.db_path)?;
			let depot = Depot::new(pool);
			let listener = TcpListener::bind(config.bind_addr).await?;
			tokio::select! {
				result = service::serve(depot, listener) => result,
				_ = tokio::signal::ctrl_c() => {
					info!("shutting down");
					Ok(())
				}
			}
		}

		Command::CacheBuild { config } => {
			let config = config::read_config(&config)?;
			let pool = Pool::open(&config.db_path)?;
			match cache::build(&pool, &config.cache_prefix)? {
				Some(version) => println!("published cache version {}", version),
				None => println!("no packed objects under {:?}", config.cache_prefix),
			}
			Ok(())
		}

		Command::NewProject {
			server,
			project,
			patterns,
			template,
			template_version,
		} => {
			let mut client = Client::connect(&server).await?;
			client
				.new_project(project, patterns, template, template_version)
				.await?;
			println!("created project {}", project);
			Ok(())
		}

		Command::DeleteProject { server, project } => {
			let mut client = Client::connect(&server).await?;
			client.delete_project(project).await?;
			println!("deleted project {}", project);
			Ok(())
		}

		Command::ListProjects { server } => {
			let mut client = Client::connect(&server).await?;
			for info in client.list_projects().await? {
				println!(
					"{}\tv{}\t{}",
					info.id,
					info.latest_version,
					info.pack_patterns.join(",")
				);
			}
			Ok(())
		}

		Command::Update {
			server,
			project,
			dir,
			subpaths,
		} => {
			let mut client = Client::connect(&server).await?;
			let version = workdir::push(&mut client, project, &dir, &subpaths).await?;
			if version == VERSION_NO_CHANGE {
				println!("no changes");
			} else {
				println!("committed version {}", version);
			}
			Ok(())
		}

		Command::Rebuild {
			server,
			project,
			dir,
			to,
			cache_dir,
			subpaths,
		} => {
			let mut client = Client::connect(&server).await?;
			let cache = match cache_dir {
				Some(path) => Some(CacheDir::open(&path)?),
				None => None,
			};
			let version =
				rebuild::rebuild(&mut client, project, &dir, to, cache.as_ref(), &subpaths).await?;
			println!("rebuilt to version {}", version);
			Ok(())
		}

		Command::Get {
			server,
			project,
			path,
			prefix,
			from,
			to,
		} => {
			let mut client = Client::connect(&server).await?;
			let query = ObjectQuery {
				path,
				is_prefix: prefix,
				..Default::default()
			};
			let (version, objects) = client.get(project, from, to, vec![query]).await?;
			for object in &objects {
				if object.deleted {
					println!("D {}", object.path);
				} else {
					println!("{:o} {:>9} {}", object.mode, object.size, object.path);
				}
			}
			println!("version {}", version);
			Ok(())
		}

		Command::Inspect { server, project } => {
			let mut client = Client::connect(&server).await?;
			let (latest, live_objects, total_bytes) = client.inspect(project).await?;
			println!("project\t{}", project);
			println!("latest_version\t{}", latest);
			println!("live_objects\t{}", live_objects);
			println!("total_bytes\t{}", total_bytes);
			Ok(())
		}

		Command::Rollback {
			server,
			project,
			version,
		} => {
			let mut client = Client::connect(&server).await?;
			client.rollback(project, version).await?;
			println!("rolled project {} back to version {}", project, version);
			Ok(())
		}

		Command::Snapshot { server } => {
			let mut client = Client::connect(&server).await?;
			for (project, version) in client.snapshot().await? {
				println!("{}={}", project, version);
			}
			Ok(())
		}

		Command::Reset { server, projects } => {
			let pairs = projects
				.iter()
				.map(|p| parse_pair(p))
				.collect::<Result<Vec<_>, _>>()?;
			let mut client = Client::connect(&server).await?;
			client.reset(pairs).await?;
			println!("reset done");
			Ok(())
		}

		Command::CloneProject {
			server,
			source,
			version,
			target,
		} => {
			let mut client = Client::connect(&server).await?;
			let latest = client.clone_to_project(source, version, target).await?;
			println!("cloned into project {} at version {}", target, latest);
			Ok(())
		}

		Command::Gc(gc) => {
			match gc {
				GcCommand::Project {
					server,
					project,
					keep,
				} => {
					let mut client = Client::connect(&server).await?;
					let removed = client.gc_project(project, keep).await?;
					println!("removed {} rows", removed);
				}
				GcCommand::RandomProjects {
					server,
					count,
					keep,
				} => {
					let mut client = Client::connect(&server).await?;
					let removed = client.gc_random_projects(count, keep).await?;
					println!("removed {} rows", removed);
				}
				GcCommand::Contents { server } => {
					let mut client = Client::connect(&server).await?;
					let removed = client.gc_contents().await?;
					println!("removed {} contents", removed);
				}
			}
			Ok(())
		}

		Command::PopulateCache {
			server,
			cache_dir,
			version,
		} => {
			let mut client = Client::connect(&server).await?;
			let cache = CacheDir::open(&cache_dir)?;
			let versions = cache.populate(&mut client, version).await?;
			println!("installed cache versions {:?}", versions);
			Ok(())
		}
	}
}

fn parse_pair(text: &str) -> Result<(i64, i64), Error> {
	let mut parts = text.splitn(2, '=');
	let parse = |part: Option<&str>| {
		part.and_then(|p| p.parse().ok())
			.ok_or_else(|| Error::Invariant(format!("bad project=version pair {:?}", text)))
	};
	let project = parse(parts.next())?;
	let version = parse(parts.next())?;
	Ok((project, version))
}
