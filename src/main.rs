use std::{
    convert::Infallible,
    io::{self, Write},
    process,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use fragcache::{
    cache::{
        CacheError, ComputeError, EventQueue, FragmentKey, InvalidationConsumer,
        InvalidationSignal, TieredOutputCache,
    },
    config,
    infra::{error::InfraError, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

fn main() {
    if let Err(error) = run() {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::CheckConfig(config::CheckConfigArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::CheckConfig(_) => run_check_config(&settings),
        config::Command::Soak(args) => run_soak(&settings, &args),
    }
}

fn run_check_config(settings: &config::Settings) -> Result<(), InfraError> {
    let mut out = io::stdout().lock();
    writeln!(out, "logging.level = {}", settings.logging.level)?;
    writeln!(out, "logging.format = {:?}", settings.logging.format)?;
    writeln!(out, "{:#?}", settings.cache)?;
    Ok(())
}

#[derive(Debug, Default)]
struct SoakTotals {
    lookups: AtomicUsize,
    loads: AtomicUsize,
    timeouts: AtomicUsize,
    invalidations: AtomicUsize,
}

fn run_soak(settings: &config::Settings, args: &config::SoakArgs) -> Result<(), InfraError> {
    if args.threads == 0 || args.keys == 0 {
        return Err(InfraError::configuration(
            "soak requires at least one thread and one key",
        ));
    }

    let cache: Arc<TieredOutputCache<FragmentKey, String>> =
        Arc::new(TieredOutputCache::new(&settings.cache));
    let queue = Arc::new(EventQueue::<String>::new(
        settings.cache.event_queue_limit_non_zero(),
    ));
    let consumer = InvalidationConsumer::new(&settings.cache, Arc::clone(&queue))
        .with_output_sink(cache.clone());
    let keys: Vec<FragmentKey> = (0..args.keys)
        .map(|index| FragmentKey::for_path("soak", format!("/fragment/{index}")))
        .collect();
    let totals = SoakTotals::default();
    let compute = Duration::from_millis(args.compute_ms);

    info!(
        threads = args.threads,
        keys = args.keys,
        iterations = args.iterations,
        "Starting soak"
    );
    let started = Instant::now();

    thread::scope(|scope| -> Result<(), InfraError> {
        let handles: Vec<_> = (0..args.threads)
            .map(|worker| {
                let cache = &cache;
                let keys = &keys;
                let totals = &totals;
                let queue = &queue;
                let consumer = &consumer;
                thread::Builder::new()
                    .name(format!("soak-{worker}"))
                    .spawn_scoped(scope, move || {
                        for step in 0..args.iterations {
                            let key = &keys[(worker + step) % keys.len()];
                            totals.lookups.fetch_add(1, Ordering::Relaxed);

                            let result = cache.get_or_compute(key, || {
                                totals.loads.fetch_add(1, Ordering::Relaxed);
                                thread::sleep(compute);
                                Ok::<_, Infallible>(Some(
                                    cache.create_entry(key.clone(), format!("rendered {key}")),
                                ))
                            });
                            match result {
                                Ok(_) => {}
                                Err(ComputeError::Cache(CacheError::LockTimeout { .. })) => {
                                    totals.timeouts.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(err) => error!(error = %err, key = %key, "soak lookup failed"),
                            }

                            if worker == 0
                                && args.invalidate_every > 0
                                && (step + 1) % args.invalidate_every == 0
                            {
                                queue.publish(InvalidationSignal::FlushAll);
                                consumer.consume_all();
                                totals.invalidations.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    })
            })
            .collect::<Result<_, _>>()?;

        for (worker, handle) in handles.into_iter().enumerate() {
            handle
                .join()
                .map_err(|_| InfraError::worker_panicked(format!("soak-{worker}")))?;
        }
        Ok(())
    })?;

    let elapsed = started.elapsed();
    let lookups = totals.lookups.load(Ordering::Relaxed);
    let loads = totals.loads.load(Ordering::Relaxed);
    let timeouts = totals.timeouts.load(Ordering::Relaxed);
    let invalidations = totals.invalidations.load(Ordering::Relaxed);

    info!(
        lookups,
        loads,
        timeouts,
        invalidations,
        elapsed_ms = elapsed.as_millis() as u64,
        "Soak complete"
    );

    let mut out = io::stdout().lock();
    writeln!(out, "lookups        {lookups}")?;
    writeln!(out, "loader calls   {loads}")?;
    writeln!(out, "lock timeouts  {timeouts}")?;
    writeln!(out, "invalidations  {invalidations}")?;
    writeln!(out, "cached entries {}", cache.len())?;
    writeln!(out, "elapsed        {elapsed:?}")?;
    Ok(())
}
