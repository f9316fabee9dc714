// CLASSIFICATION: COMMUNITY
// Filename: main.rs v0.6
// Author: Lukas Bower
// Date Modified: 2026-08-24

//! Entry point for the broker server binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use asmbroker::api::{self, Broker};
use asmbroker::cache::ResultCache;
use asmbroker::cli::BrokerArgs;
use asmbroker::compile::{CompileEnv, Lane};
use asmbroker::config::Config;
use asmbroker::exec::sandbox::SandboxMode;
use asmbroker::registry::{CompilerPool, Registry};
use asmbroker::workspace::WorkspaceAllocator;

fn main() {
    let args = BrokerArgs::parse();
    let mut builder = env_logger::Builder::from_default_env();
    if args.debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    if let Err(err) = run(args) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(args: BrokerArgs) -> Result<()> {
    let cfg = Arc::new(
        Config::load(&args.prefix, &args.env, args.language.as_deref())
            .context("load configuration")?,
    );
    if args.debug_properties {
        println!("{cfg:#?}");
    }
    if let Some(dir) = &args.static_dir {
        info!("static assets in {} are served by the front proxy", dir.display());
    }
    if let Some(manifest) = &args.archived_versions {
        info!("archived versions manifest: {manifest}");
    }

    let workspaces = Arc::new(
        WorkspaceAllocator::new(cfg.temp_root(args.wsl)).context("initialize temp root")?,
    );
    workspaces.start_sweeper(cfg.temp_dir_cleanup_secs);

    let sandbox = SandboxMode::from_config(&cfg.sandbox_type)?;
    let env = CompileEnv {
        cfg: Arc::clone(&cfg),
        cache: Arc::new(ResultCache::new(cfg.cache_size_bytes)),
        workspaces,
        lane: Arc::new(Lane::new(cfg.max_concurrent_compiles)),
        sandbox,
    };

    let pool = Arc::new(CompilerPool::new());
    let registry = Arc::new(Registry::new(
        Arc::clone(&cfg),
        Arc::clone(&pool),
        args.port,
    ));
    let count = registry.bootstrap().context("initialize compiler registry")?;
    info!("{count} compilers available");
    registry.start_rescan_timer();

    let broker = Arc::new(Broker { cfg, env, pool });
    api::serve(broker, &args.host, args.port)
}
