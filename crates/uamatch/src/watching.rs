//! Auto-reloading provider
//!
//! [`WatchingProvider`] wraps a [`Provider`] and swaps in a fresh one when
//! the data file changes on disk. Queries go through a lock-free Arc swap
//! with per-thread pointer caching, so the hot path costs one atomic load.
//! The superseded provider is dropped once the last in-flight match
//! releases its reference, which closes the old dataset's source.
//!
//! # Example
//!
//! ```no_run
//! use uamatch::WatchingProvider;
//!
//! let provider = WatchingProvider::from("devices.uamd")
//!     .on_reload(|event| {
//!         if event.success {
//!             eprintln!("reloaded, generation {}", event.generation);
//!         }
//!     })
//!     .open()?;
//!
//! // Matches transparently use the latest dataset.
//! let result = provider.match_user_agent("Mozilla/5.0 (iPhone; CPU iPhone OS 9_0 like Mac OS X)")?;
//! # let _ = result;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::{Result, UamatchError};
use crate::matcher::Match;
use crate::provider::{Provider, ProviderOptions};
use arc_swap::ArcSwap;
use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Event fired after a reload attempt
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    /// Path of the watched data file
    pub path: PathBuf,
    /// Whether the reload succeeded
    pub success: bool,
    /// Failure message when `success` is false
    pub error: Option<String>,
    /// Generation counter after the attempt
    pub generation: u64,
}

/// Callback type for reload notifications
pub type ReloadCallback = Arc<dyn Fn(ReloadEvent) + Send + Sync>;

struct WatcherThread {
    shutdown_tx: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Drop for WatcherThread {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct WatcherState {
    /// Keeps the OS watch registered for the provider's lifetime
    _watcher: notify::RecommendedWatcher,
    _thread: WatcherThread,
}

thread_local! {
    static LOCAL_PROVIDER: RefCell<Option<Arc<Provider>>> = const { RefCell::new(None) };
    static LOCAL_GENERATION: Cell<u64> = const { Cell::new(0) };
}

/// Generations are drawn from a process-wide counter so the thread-local
/// pointer cache can never confuse two watching providers.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Provider wrapper that hot-swaps its dataset when the file changes
pub struct WatchingProvider {
    current: Arc<ArcSwap<Provider>>,
    generation: Arc<AtomicU64>,
    _watcher: WatcherState,
}

impl WatchingProvider {
    /// Create a builder watching the data file at `path`
    pub fn from(path: impl Into<PathBuf>) -> WatchingProviderOpener {
        WatchingProviderOpener::new(path)
    }

    /// Match a User-Agent against the latest dataset
    pub fn match_user_agent(&self, user_agent: &str) -> Result<Match> {
        let current_generation = self.generation.load(Ordering::Acquire);
        let needs_refresh = LOCAL_GENERATION.with(|local| {
            if local.get() != current_generation {
                local.set(current_generation);
                true
            } else {
                false
            }
        });
        if needs_refresh {
            LOCAL_PROVIDER.with(|local| {
                *local.borrow_mut() = Some(self.current.load_full());
            });
        }
        LOCAL_PROVIDER.with(|local| {
            let provider = local.borrow();
            provider
                .as_ref()
                .expect("generation check populated the local provider")
                .match_user_agent(user_agent)
        })
    }

    /// Generation counter; strictly increases on every successful reload
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Pin the current provider for a sequence of consistent operations
    pub fn snapshot(&self) -> Arc<Provider> {
        self.current.load_full()
    }
}

/// Builder for a [`WatchingProvider`]
pub struct WatchingProviderOpener {
    options: ProviderOptions,
    debounce: Option<Duration>,
    reload_callback: Option<ReloadCallback>,
}

impl WatchingProviderOpener {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            options: ProviderOptions {
                path: Some(path.into()),
                ..Default::default()
            },
            debounce: None,
            reload_callback: None,
        }
    }

    /// Memory-map the data file
    pub fn memory_mode(mut self) -> Self {
        self.options.memory_mode = true;
        self
    }

    /// UA result cache capacity of each underlying provider
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.options.cache_capacity = Some(capacity);
        self
    }

    /// Quiet window after the last file event before reloading
    ///
    /// Defaults to the options' `cache_service_interval`, floored at
    /// 100 ms so rewrite-in-place bursts coalesce into one reload.
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    /// Callback invoked after every reload attempt
    pub fn on_reload<F>(mut self, callback: F) -> Self
    where
        F: Fn(ReloadEvent) + Send + Sync + 'static,
    {
        self.reload_callback = Some(Arc::new(callback));
        self
    }

    /// Open the watching provider
    pub fn open(self) -> Result<WatchingProvider> {
        use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
        use std::sync::mpsc::RecvTimeoutError;

        let path = self
            .options
            .path
            .clone()
            .ok_or_else(|| {
                UamatchError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "watching provider requires a file path",
                ))
            })?
            .canonicalize()?;
        let debounce = self
            .debounce
            .unwrap_or(self.options.cache_service_interval)
            .max(Duration::from_millis(100));

        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();

        let mut watcher = RecommendedWatcher::new(event_tx, Config::default())
            .map_err(|e| std::io::Error::other(format!("failed to create file watcher: {e}")))?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| std::io::Error::other(format!("failed to watch {path:?}: {e}")))?;

        let initial = Provider::open_with_options(self.options.clone())?;
        let current = Arc::new(ArcSwap::from_pointee(initial));
        // Generation 0 is reserved for the thread-local "never seen" state.
        let generation = Arc::new(AtomicU64::new(
            NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        ));

        let thread_current = Arc::clone(&current);
        let thread_generation = Arc::clone(&generation);
        let thread_path = path.clone();
        let thread_callback = self.reload_callback.clone();
        let thread_options = self.options;

        let handle = thread::spawn(move || {
            let mut last_event: Option<Instant> = None;
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                match event_rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(Ok(_event)) => last_event = Some(Instant::now()),
                    Ok(Err(_)) => {}
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(seen) = last_event else { continue };
                        if seen.elapsed() < debounce {
                            continue;
                        }
                        last_event = None;
                        match Provider::open_with_options(thread_options.clone()) {
                            Ok(provider) => {
                                let generation =
                                    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
                                thread_current.store(Arc::new(provider));
                                thread_generation.store(generation, Ordering::Release);
                                if let Some(callback) = &thread_callback {
                                    callback(ReloadEvent {
                                        path: thread_path.clone(),
                                        success: true,
                                        error: None,
                                        generation,
                                    });
                                }
                            }
                            Err(error) => {
                                warn!(%error, path = ?thread_path, "dataset reload failed");
                                if let Some(callback) = &thread_callback {
                                    callback(ReloadEvent {
                                        path: thread_path.clone(),
                                        success: false,
                                        error: Some(error.to_string()),
                                        generation: thread_generation.load(Ordering::Acquire),
                                    });
                                }
                            }
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Ok(WatchingProvider {
            current,
            generation,
            _watcher: WatcherState {
                _watcher: watcher,
                _thread: WatcherThread {
                    shutdown_tx,
                    handle: Some(handle),
                },
            },
        })
    }
}
