use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use trellis_api::Bootstrap;
use trellis_core::access_log::AccessLogManager;
use trellis_core::factory::{ProdClusterManagerFactory, ValidationClusterManagerFactory};
use trellis_core::stats::Store;
use trellis_core::{ClusterManager, ClusterManagerFactory, LocalInfo};

mod options;
use options::{Mode, Options};

/// Bumped whenever the shared-memory layout between hot-restart epochs
/// changes.
const HOT_RESTART_VERSION: &str = "trellis.hot-restart.v1";

fn main() -> ExitCode {
    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    if options.hot_restart_version {
        println!("{HOT_RESTART_VERSION}");
        return ExitCode::SUCCESS;
    }

    init_tracing(&options.log_level);

    match run(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(options: Options) -> Result<(), Box<dyn std::error::Error>> {
    let Some(bootstrap_file) = options.bootstrap_file() else {
        return Err("no bootstrap file: pass --bootstrap-path or --config-path".into());
    };
    let data = std::fs::read_to_string(bootstrap_file)?;
    let bootstrap = Bootstrap::from_json(&data)?;

    let local_info = LocalInfo::new(
        options.service_node.clone(),
        options.service_cluster.clone(),
        options.service_zone.clone(),
    );

    match options.mode {
        Mode::Validate => validate(&bootstrap, &options),
        Mode::Serve => serve(bootstrap, local_info, options),
    }
}

/// Drive the whole startup pipeline against the validation factory: no
/// sockets, no DNS, no subscriptions, no workers. Any config error the
/// server would hit surfaces here.
fn validate(bootstrap: &Bootstrap, options: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let factory: Arc<dyn ClusterManagerFactory> = Arc::new(ValidationClusterManagerFactory::new(
        options.local_address_ip_version.into(),
    ));
    let store = Store::new();
    let access_logs = AccessLogManager::new();

    match ClusterManager::new(bootstrap, factory, &store, &access_logs, 0) {
        Ok((manager, _)) => {
            manager.shutdown();
            println!("configuration OK");
            Ok(())
        }
        Err(e) => Err(format!("configuration invalid: {e}").into()),
    }
}

fn serve(
    bootstrap: Bootstrap,
    local_info: LocalInfo,
    options: Options,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        tracing::info!(
            base_id = options.base_id(),
            restart_epoch = options.restart_epoch,
            concurrency = options.concurrency,
            "starting trellis"
        );

        let factory: Arc<dyn ClusterManagerFactory> = Arc::new(ProdClusterManagerFactory::new(
            local_info,
            options.local_address_ip_version.into(),
        ));
        let store = Store::new();
        let access_logs = AccessLogManager::new();

        let (manager, workers) = ClusterManager::new(
            &bootstrap,
            factory,
            &store,
            &access_logs,
            options.concurrency.max(1),
        )?;

        for worker in workers {
            tokio::spawn(worker.run());
        }

        manager.set_initialized_cb(|| {
            tracing::info!("all clusters initialized, accepting traffic");
        });

        tokio::signal::ctrl_c().await?;
        tracing::info!(drain_time = ?options.drain_time(), "shutting down");
        manager.shutdown();

        Ok(())
    })
}
