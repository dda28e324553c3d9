//! Config for the tokio main IO runtime.

use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

/// Tokio runtime type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TokioRuntimeType {
    /// Current-thread runtime.
    CurrentThread,

    /// Multi-thread runtime.
    #[default]
    MultiThread,
}

/// CLI config for tokio IO runtime.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct TokioIoConfig {
    /// Set the maximum number of IO runtime threads to use.
    ///
    /// Defaults to the number of logical cores on the system.
    #[clap(
        id = "io_runtime_num_threads",
        long = "num-io-threads",
        alias = "num-threads",
        env = "RATINGS_NUM_IO_THREADS",
        action
    )]
    pub num_threads: Option<NonZeroUsize>,

    /// IO tokio runtime type.
    #[clap(
        id = "io_runtime_type",
        long = "io-runtime-type",
        env = "RATINGS_IO_RUNTIME_TYPE",
        default_value_t = TokioRuntimeType::default(),
        value_enum,
        action
    )]
    pub runtime_type: TokioRuntimeType,

    /// Sets a custom timeout for a thread in the blocking pool of the tokio IO runtime.
    #[clap(
        id = "io_runtime_thread_keep_alive",
        long = "io-runtime-thread-keep-alive",
        env = "RATINGS_IO_RUNTIME_THREAD_KEEP_ALIVE",
        value_parser = humantime::parse_duration
    )]
    pub thread_keep_alive: Option<Duration>,
}

impl TokioIoConfig {
    /// Creates the tokio runtime builder.
    pub fn builder(&self) -> Result<::tokio::runtime::Builder, std::io::Error> {
        self.builder_with_name("IO")
    }

    /// Creates the tokio runtime builder.
    pub fn builder_with_name(&self, name: &str) -> Result<::tokio::runtime::Builder, std::io::Error> {
        // NOTE: no log macros will work here!
        //
        // That means use eprintln!() instead of error!() and so on. The log emitter
        // is initialised after this function.

        let mut builder = match self.runtime_type {
            TokioRuntimeType::CurrentThread => ::tokio::runtime::Builder::new_current_thread(),
            TokioRuntimeType::MultiThread => {
                let mut builder = ::tokio::runtime::Builder::new_multi_thread();

                // worker thread count
                let num_threads = match self.num_threads {
                    None => std::thread::available_parallelism()?,
                    Some(n) => n,
                };
                builder.worker_threads(num_threads.get());
                builder
            }
        };

        // enable subsystems
        // - always enable timers
        builder.enable_time();
        builder.enable_io();

        // set up proper thread names
        let thread_counter = Arc::new(AtomicUsize::new(1));
        let name = name.to_owned();
        builder.thread_name_fn(move || {
            format!(
                "ratings tokio {} {}",
                name,
                thread_counter.fetch_add(1, Ordering::SeqCst)
            )
        });

        if let Some(x) = self.thread_keep_alive {
            builder.thread_keep_alive(x);
        }

        Ok(builder)
    }
}
