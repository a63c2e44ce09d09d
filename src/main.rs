use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use priskv::acl::Acl;
use priskv::arena::Arena;
use priskv::backend::{BackendDevice, BackendRegistry};
use priskv::config::Config;
use priskv::error::EngineError;
use priskv::index::KvIndex;
use priskv::metrics::Metrics;
use priskv::pipeline::Pipeline;
use priskv::policy::create_policy;
use priskv::threadpool::{ThreadHandle, ThreadHooks, ThreadPool};

#[derive(Parser, Debug)]
#[command(name = "priskvd", about = "PrisKV core storage-and-transport engine")]
struct Args {
    /// Path to the TOML configuration file (overrides PRISKV_CONFIG).
    #[arg(long)]
    config: Option<String>,
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();
    if let Some(path) = &args.config {
        // SAFETY: single-threaded at this point, before any worker spawns.
        unsafe {
            std::env::set_var("PRISKV_CONFIG", path);
        }
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("priskvd exiting: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let config = Config::load();
    config
        .arena
        .validate()
        .map_err(anyhow::Error::from)
        .context("invalid arena configuration")?;

    let acl = Acl::from_rules(&config.acl.rules).context("invalid ACL configuration")?;
    info!("loaded {} ACL rule(s)", acl.rules().len());

    let arena = open_arena(&config.arena).context("failed to open memory arena")?;
    let metrics = Arc::new(Metrics::new());
    let policy = create_policy("lru").expect("lru policy is always registered");
    let index = KvIndex::new(arena, policy, metrics.clone());

    let backend = if config.tiering.enabled {
        let registry = BackendRegistry::with_builtins();
        Some(
            BackendDevice::open(&config.tiering.backend_address, &registry)
                .context("failed to open tiering backend")?,
        )
    } else {
        None
    };
    info!("tiering enabled: {}", backend.is_some());

    // The pipeline (index + backend chain) is mutated only from the
    // background thread that owns the expiry sweep (§5's owner-thread
    // invariant) — the main thread only ever reaches it by submitting work
    // items through that thread's work queue, never by locking and calling
    // in directly.
    let pipeline = Arc::new(Mutex::new(Pipeline::new(index, backend)));

    let hooks: Arc<dyn ThreadHooks> = if config.tiering.enabled {
        Arc::new(TieringHooks {
            registry: Arc::new(BackendRegistry::with_builtins()),
            backend_address: config.tiering.backend_address.clone(),
        })
    } else {
        Arc::new(NoTieringHooks)
    };

    let pool = ThreadPool::create_with_hooks(
        "priskvd",
        config.threadpool.n_io_threads,
        config.threadpool.n_bg_threads,
        config.threadpool.busy_poll,
        hooks,
    )
    .context("failed to start thread pool")?;
    info!(
        "thread pool started: {} io threads, {} bg threads (busy_poll={})",
        config.threadpool.n_io_threads, config.threadpool.n_bg_threads, config.threadpool.busy_poll
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_for_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_for_handler.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    let sweep_interval = Duration::from_millis(config.expiry.sweep_interval_ms);
    let sweep_batch = config.expiry.sweep_batch;
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(sweep_interval);
        // Expiry sweeps run on a background thread's work queue so they
        // never contend with an I/O thread's owner-thread invariant (§5).
        if let Some(bg) = pool.find_bgthread() {
            let pipeline = pipeline.clone();
            bg.submit(move || {
                pipeline.lock().unwrap().expire_tick(sweep_batch);
                0
            });
        }
    }

    info!("shutting down");
    pool.shutdown();
    Ok(())
}

/// Per-thread binding for the tiering backend (§4.6): each I/O thread opens
/// its own chain in its init hook and stashes it as thread-local user data,
/// closing it in the cleanup hook. Background threads don't need a backend
/// handle of their own (they only ever reach the engine through a work item
/// on the thread that owns it), so `init`/`cleanup` are no-ops there.
struct TieringHooks {
    registry: Arc<BackendRegistry>,
    backend_address: String,
}

impl ThreadHooks for TieringHooks {
    fn init(&self, thread: &ThreadHandle) {
        if !thread.name.contains("-io-") {
            return;
        }
        match BackendDevice::open(&self.backend_address, &self.registry) {
            Ok(device) => thread.set_user_data(device),
            Err(e) => error!("{}: failed to open per-thread backend: {e}", thread.name),
        }
    }

    fn cleanup(&self, thread: &ThreadHandle) {
        if let Some(mut device) = thread.take_user_data::<BackendDevice>() {
            if let Err(e) = device.close() {
                error!("{}: backend close failed: {e}", thread.name);
            }
        }
    }
}

struct NoTieringHooks;

impl ThreadHooks for NoTieringHooks {
    fn init(&self, _thread: &ThreadHandle) {}
    fn cleanup(&self, _thread: &ThreadHandle) {}
}

fn open_arena(cfg: &priskv::config::ArenaConfig) -> Result<Arena, EngineError> {
    if cfg.path.is_empty() {
        return Arena::anonymous(
            cfg.max_key_length,
            cfg.max_keys,
            cfg.value_block_size,
            cfg.value_blocks,
        );
    }

    let path = std::path::Path::new(&cfg.path);
    if path.exists() {
        Arena::load(path)
    } else {
        Arena::create(
            path,
            cfg.max_key_length,
            cfg.max_keys,
            cfg.value_block_size,
            cfg.value_blocks,
        )
    }
}
