use crate::{Command, CommandSink, DataRequestMonitor, ExecutionContext, RequestError, RequestResult};
use parking_lot::Mutex;
use std::{
    any::{Any, TypeId},
    collections::{HashMap, HashSet},
    sync::Arc,
};
use util::post_inc;

type Subscribers<V> = Arc<Mutex<Vec<DataRequestMonitor<V>>>>;

/// Coalesces equivalent commands and caches their successful results.
///
/// Commands are equivalent when they share a signature, a context and an output type. A
/// command arriving while an equivalent one is in flight waits for that exchange instead
/// of issuing its own. Mutating commands bypass the cache and invalidate every entry in
/// the contexts they affect, both before they are sent and once they complete.
pub struct CommandCache<S: CommandSink> {
    sink: S,
    state: Arc<Mutex<CacheState>>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    unavailable: HashSet<ExecutionContext>,
    next_entry_id: u64,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    output: TypeId,
    signature: String,
    context: ExecutionContext,
}

enum CacheEntry {
    InFlight {
        id: u64,
        subscribers: Box<dyn Any + Send>,
    },
    Cached(Box<dyn Any + Send>),
}

impl<S: CommandSink> Clone for CommandCache<S> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            state: self.state.clone(),
        }
    }
}

impl<S: CommandSink> CommandCache<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            state: Default::default(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn execute<C>(&self, command: C, rm: DataRequestMonitor<C::Output>)
    where
        C: Command,
        C::Output: Clone,
    {
        let executor = self.sink.executor();
        if !executor.is_executor_thread() {
            let this = self.clone();
            executor.submit(move || this.execute(command, rm));
            return;
        }

        let context = command.context().clone();
        if !self.is_context_available(&context) {
            rm.fail(RequestError::InvalidState(format!(
                "context {context} is not available"
            )));
            return;
        }

        if command.is_mutating() {
            self.reset_context(&context);
            let this = self.clone();
            let parent = rm.clone();
            let done_rm = DataRequestMonitor::new_child(&rm, move |result| {
                this.reset_context(&context);
                parent.complete(result);
            });
            self.sink.queue_command(command, done_rm);
            return;
        }

        let key = CacheKey {
            output: TypeId::of::<C::Output>(),
            signature: command.signature(),
            context,
        };
        let (id, subscribers) = {
            let mut state = self.state.lock();
            match state.entries.get(&key) {
                Some(CacheEntry::Cached(value)) => {
                    if let Some(value) = value.downcast_ref::<C::Output>() {
                        let value = value.clone();
                        drop(state);
                        log::trace!("cache hit for {}", key.signature);
                        rm.done_with(value);
                        return;
                    }
                }
                Some(CacheEntry::InFlight { subscribers, .. }) => {
                    if let Some(subscribers) = subscribers.downcast_ref::<Subscribers<C::Output>>() {
                        subscribers.lock().push(rm);
                        return;
                    }
                }
                None => {}
            }

            let id = post_inc(&mut state.next_entry_id);
            let subscribers: Subscribers<C::Output> = Arc::new(Mutex::new(vec![rm]));
            state.entries.insert(
                key.clone(),
                CacheEntry::InFlight {
                    id,
                    subscribers: Box::new(subscribers.clone()),
                },
            );
            (id, subscribers)
        };

        let this = self.clone();
        let exchange_rm = DataRequestMonitor::new(executor, move |result| {
            this.exchange_finished(key, id, subscribers, result)
        });
        self.sink.queue_command(command, exchange_rm);
    }

    fn exchange_finished<V: Clone + Send + 'static>(
        &self,
        key: CacheKey,
        id: u64,
        subscribers: Subscribers<V>,
        result: RequestResult<V>,
    ) {
        let subscribers = {
            let mut state = self.state.lock();
            let current = matches!(
                state.entries.get(&key),
                Some(CacheEntry::InFlight { id: entry_id, .. }) if *entry_id == id
            );
            if current {
                match &result {
                    Ok(value) => {
                        state
                            .entries
                            .insert(key, CacheEntry::Cached(Box::new(value.clone())));
                    }
                    Err(_) => {
                        state.entries.remove(&key);
                    }
                }
            }
            std::mem::take(&mut *subscribers.lock())
        };
        for subscriber in subscribers {
            subscriber.complete(result.clone());
        }
    }

    /// Drops every cached result. In-flight exchanges still complete their subscribers but
    /// their results are not cached.
    pub fn reset(&self) {
        self.state.lock().entries.clear();
    }

    /// Drops the entries of `context` and of every context below it.
    pub fn reset_context(&self, context: &ExecutionContext) {
        self.state
            .lock()
            .entries
            .retain(|key, _| !context.affects(&key.context));
    }

    /// While a context is unavailable, commands targeting it or anything below it fail
    /// without reaching the debugger.
    pub fn set_context_available(&self, context: &ExecutionContext, available: bool) {
        let mut state = self.state.lock();
        if available {
            state.unavailable.remove(context);
        } else {
            state.unavailable.insert(context.clone());
        }
    }

    pub fn is_context_available(&self, context: &ExecutionContext) -> bool {
        !self
            .state
            .lock()
            .unavailable
            .iter()
            .any(|unavailable| unavailable.affects(context))
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| matches!(entry, CacheEntry::Cached(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
