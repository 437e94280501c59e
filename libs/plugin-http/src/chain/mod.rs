//! Plugin chain executor.
//!
//! A [`PluginChain`] is the immutable, configured list of plugins. Every
//! [`PluginChain::dispatch`] creates a fresh chain state with its own
//! [`ChainId`], restart counter and scratch storage, and hands the first
//! plugin a [`RequestHandler`] positioned right after it. Plugins continue
//! with [`RequestHandler::handle`], start over with
//! [`RequestHandler::restart`], or splice in more plugins with
//! [`RequestHandler::insert_after`].

mod matcher;

pub use matcher::{RegexRequestMatcher, RequestMatcher};

use crate::error::HttpError;
use crate::message::Request;
use crate::promise::Promise;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A unit of request/response transformation.
pub trait Plugin: Send + Sync + 'static {
    /// Handle `request`, usually by calling `next.handle(..)` and
    /// transforming the resulting promise.
    fn process(&self, request: Request, next: RequestHandler) -> Promise;
}

impl<P: Plugin + ?Sized> Plugin for Arc<P> {
    fn process(&self, request: Request, next: RequestHandler) -> Promise {
        (**self).process(request, next)
    }
}

/// Plugin made from a closure.
pub struct FnPlugin<F>(F);

/// Wrap a closure as a [`Plugin`].
#[must_use]
pub fn plugin_fn<F>(f: F) -> FnPlugin<F>
where
    F: Fn(Request, RequestHandler) -> Promise + Send + Sync + 'static,
{
    FnPlugin(f)
}

impl<F> Plugin for FnPlugin<F>
where
    F: Fn(Request, RequestHandler) -> Promise + Send + Sync + 'static,
{
    fn process(&self, request: Request, next: RequestHandler) -> Promise {
        (self.0)(request, next)
    }
}

/// One position in the chain: a plugin and the matchers gating it.
#[derive(Clone)]
pub struct ChainEntry {
    plugin: Arc<dyn Plugin>,
    matchers: Arc<[Arc<dyn RequestMatcher>]>,
}

impl ChainEntry {
    #[must_use]
    pub fn new(plugin: impl Plugin) -> Self {
        Self::from_arc(Arc::new(plugin))
    }

    #[must_use]
    pub fn from_arc(plugin: Arc<dyn Plugin>) -> Self {
        Self {
            plugin,
            matchers: Arc::from(Vec::new()),
        }
    }

    /// Entry that only runs when every matcher accepts the request.
    #[must_use]
    pub fn conditional(matchers: Vec<Arc<dyn RequestMatcher>>, plugin: impl Plugin) -> Self {
        Self {
            plugin: Arc::new(plugin),
            matchers: Arc::from(matchers),
        }
    }

    fn applies(&self, request: &Request) -> bool {
        self.matchers.iter().all(|m| m.matches(request))
    }
}

/// Identity of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(u64);

static NEXT_CHAIN_ID: AtomicU64 = AtomicU64::new(1);

impl ChainId {
    fn next() -> Self {
        Self(NEXT_CHAIN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain-{}", self.0)
    }
}

/// Configured plugin list.
#[derive(Clone)]
pub struct PluginChain {
    entries: Arc<[ChainEntry]>,
    max_restarts: usize,
}

impl PluginChain {
    #[must_use]
    pub fn new(entries: Vec<ChainEntry>, max_restarts: usize) -> Self {
        Self {
            entries: Arc::from(entries),
            max_restarts,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `request` through the chain from the first entry.
    pub fn dispatch(&self, request: Request) -> Promise {
        let state = Arc::new(ChainState {
            id: ChainId::next(),
            template: Arc::clone(&self.entries),
            entries: Mutex::new(self.entries.to_vec()),
            restarts: AtomicUsize::new(0),
            max_restarts: self.max_restarts,
            scratch: Mutex::new(http::Extensions::new()),
        });
        tracing::trace!(chain = %state.id, uri = %request.uri(), "dispatching request");
        RequestHandler { state, index: 0 }.run(request)
    }
}

impl fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginChain")
            .field("entries", &self.entries.len())
            .field("max_restarts", &self.max_restarts)
            .finish()
    }
}

/// Per-dispatch state shared by every handler of that dispatch.
struct ChainState {
    id: ChainId,
    template: Arc<[ChainEntry]>,
    entries: Mutex<Vec<ChainEntry>>,
    restarts: AtomicUsize,
    max_restarts: usize,
    scratch: Mutex<http::Extensions>,
}

/// Continuation handed to a plugin.
///
/// Positioned right after the plugin it was given to.
#[derive(Clone)]
pub struct RequestHandler {
    state: Arc<ChainState>,
    index: usize,
}

impl RequestHandler {
    fn run(&self, request: Request) -> Promise {
        let next = {
            let entries = self.state.entries.lock();
            entries
                .iter()
                .enumerate()
                .skip(self.index)
                .find(|(_, entry)| entry.applies(&request))
                .map(|(position, entry)| (position, Arc::clone(&entry.plugin)))
        };

        match next {
            Some((position, plugin)) => plugin.process(
                request,
                RequestHandler {
                    state: Arc::clone(&self.state),
                    index: position + 1,
                },
            ),
            None => Promise::rejected(HttpError::Configuration(
                "plugin chain exhausted without a terminal plugin".to_owned(),
            )),
        }
    }

    /// Continue with the next applicable plugin.
    pub fn handle(&self, request: Request) -> Promise {
        self.run(request)
    }

    /// Start the chain over from the first plugin.
    ///
    /// Plugins added with [`RequestHandler::insert_after`] are dropped, the
    /// scratch state is kept.
    pub fn restart(&self, request: Request) -> Promise {
        let restarts = self.state.restarts.fetch_add(1, Ordering::AcqRel) + 1;
        if restarts > self.state.max_restarts {
            tracing::warn!(
                chain = %self.state.id,
                max_restarts = self.state.max_restarts,
                "plugin chain restart limit exceeded"
            );
            return Promise::rejected(HttpError::Loop {
                max_restarts: self.state.max_restarts,
            });
        }
        tracing::debug!(chain = %self.state.id, restarts, uri = %request.uri(), "restarting plugin chain");

        *self.state.entries.lock() = self.state.template.to_vec();
        RequestHandler {
            state: Arc::clone(&self.state),
            index: 0,
        }
        .run(request)
    }

    /// Insert `plugin` right after the current position.
    pub fn insert_after(&self, plugin: impl Plugin) {
        let mut entries = self.state.entries.lock();
        let at = self.index.min(entries.len());
        entries.insert(at, ChainEntry::new(plugin));
    }

    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        self.state.id
    }

    /// Restarts performed so far in this dispatch.
    #[must_use]
    pub fn restarts(&self) -> usize {
        self.state.restarts.load(Ordering::Acquire)
    }

    /// Access dispatch-scoped scratch state of type `S`.
    ///
    /// The value survives restarts and is dropped with the dispatch.
    pub fn with_state<S, R>(&self, f: impl FnOnce(&mut S) -> R) -> R
    where
        S: Default + Clone + Send + Sync + 'static,
    {
        let mut scratch = self.state.scratch.lock();
        f(scratch.get_or_insert_default::<S>())
    }
}

impl fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandler")
            .field("chain", &self.state.id)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
