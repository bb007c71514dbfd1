//! this binary starts one rank of the table substrate
//! to see the list of commands, type: `table-server --help`

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::{crate_version, App, Arg};
use shardtable::{
    GlobalConfig, ModelController, Result, Runtime, Tag, TcpFabric,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    config_path: PathBuf,
    rank: Option<usize>,
    data_dir: Option<PathBuf>,
    synchronous: bool,
}

impl Opt {
    /// merges the command line over the config file and validates the result
    fn into_config(self) -> Result<GlobalConfig> {
        let mut config = GlobalConfig::from_file(&self.config_path)?;
        if let Some(rank) = self.rank {
            config.rank = rank;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if self.synchronous {
            config.synchronous = true;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() {
    // set up a tracing subscriber to log to STDERR
    subscriber_config();

    let matches = App::new("table-server")
        .version(crate_version!())
        .about("one rank of the distributed table substrate")
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("path to the cluster config JSON")
                .required(true),
        )
        .arg(
            Arg::with_name("rank")
                .long("rank")
                .value_name("RANK")
                .help("overrides the rank from the config file"),
        )
        .arg(
            Arg::with_name("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("overrides the data directory from the config file"),
        )
        .arg(
            Arg::with_name("sync")
                .long("sync")
                .help("use the synchronous (per-key interlocking) request queue"),
        )
        .arg(
            Arg::with_name("model")
                .long("model")
                .value_name("FILE")
                .help("model description the coordinator broadcasts to the workers"),
        )
        .get_matches();

    let model_blob = match matches.value_of("model") {
        None => None,
        Some(path) => match std::fs::read_to_string(path) {
            Ok(blob) => Some(blob),
            Err(e) => {
                eprintln!("could not read model file {}: {}", path, e);
                exit(1);
            }
        },
    };

    let rank = match matches.value_of("rank").map(|r| r.parse::<usize>()) {
        None => None,
        Some(Ok(rank)) => Some(rank),
        Some(Err(e)) => {
            eprintln!("invalid --rank: {}", e);
            exit(1);
        }
    };
    let opt = Opt {
        config_path: PathBuf::from(matches.value_of("config").unwrap()),
        rank,
        data_dir: matches.value_of("data-dir").map(PathBuf::from),
        synchronous: matches.is_present("sync"),
    };

    let config = match opt.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:?}", e);
            exit(1);
        }
    };

    if let Err(e) = run(config, model_blob) {
        eprintln!("{:?}", e);
        exit(1);
    }
}

fn run(config: GlobalConfig, model_blob: Option<String>) -> Result<()> {
    info!("table-server {}", env!("CARGO_PKG_VERSION"));
    info!(
        "rank {} of {}, {} table servers, {} queue",
        config.rank,
        config.world_size,
        config.num_table_servers,
        if config.synchronous { "sync" } else { "async" }
    );

    if config.hosts.len() != config.world_size {
        return Err(shardtable::ShardError::Config(format!(
            "config must list one host per rank ({} hosts for {} ranks)",
            config.hosts.len(),
            config.world_size
        )));
    }
    let fabric = Arc::new(TcpFabric::bind(
        config.rank,
        config.hosts.clone(),
        config.sleep_quantum(),
    )?);
    let runtime = Runtime::start(config, fabric)?;
    let mut controller = ModelController::new(&runtime, 2)?;
    let _train_store = controller.create_data_store(&runtime, "train-data", None);

    let config = runtime.config().clone();
    let server = runtime.table_server().clone();
    if config.is_table_server() {
        server.announce_ready()?;
    }

    if config.is_coordinator() {
        // bring the cluster up: every server serving, then ship the model
        // description and release everyone
        server.await_servers()?;
        info!("all table servers serving");
        let spec = shardtable::message::ModelSpec {
            blob: model_blob.unwrap_or_default(),
        };
        runtime
            .transport()
            .broadcast(Tag::ModelConfig, &shardtable::message::encode_control(&spec)?);
        runtime.barrier()?;
        // the trainer drives the tables from here; this harness just waits
        // for the step barrier and tears the cluster back down
        runtime.barrier()?;
        runtime.transport().broadcast(Tag::Shutdown, &[]);
        runtime.transport().flush();
    } else {
        let (payload, _) = runtime
            .transport()
            .read(config.coordinator_rank(), Tag::ModelConfig)?;
        let spec: shardtable::message::ModelSpec =
            shardtable::message::decode_control(&payload)?;
        info!("received model config ({} bytes)", spec.blob.len());
        runtime.barrier()?;
        runtime.barrier()?;
        runtime
            .transport()
            .read(config.coordinator_rank(), Tag::Shutdown)?;
    }

    runtime.shutdown();
    Ok(())
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
