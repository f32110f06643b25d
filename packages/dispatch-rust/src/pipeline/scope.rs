use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

/// How long an instance resolved for a pipeline lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifetime {
    /// A new instance for every resolution, released with the pipeline.
    #[default]
    Transient,
    /// One instance per pipeline build, shared by every step that resolves it.
    Scoped,
    /// One instance for the life of the registration; never released.
    Singleton,
}

/// Creates and releases handler or middleware instances.
///
/// Any `Fn() -> Arc<H>` closure is a factory with a no-op release.
pub trait HandlerFactory<H: ?Sized>: Send + Sync {
    fn create(&self) -> Arc<H>;

    /// Called once per created transient or scoped instance when its pipeline finishes.
    fn release(&self, _instance: Arc<H>) {}
}

impl<H: ?Sized, F> HandlerFactory<H> for F
where
    F: Fn() -> Arc<H> + Send + Sync,
{
    fn create(&self) -> Arc<H> {
        self()
    }
}

/// Downstream work a timeout step stopped waiting for but which is still running.
#[derive(Clone, Default)]
pub(crate) struct Stragglers(Arc<Mutex<Vec<BoxFuture<'static, ()>>>>);

impl Stragglers {
    pub(crate) fn push(&self, work: BoxFuture<'static, ()>) {
        self.0.lock().push(work);
    }

    pub(crate) fn take(&self) -> Vec<BoxFuture<'static, ()>> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Owns the instances resolved for one pipeline and releases them on drop.
///
/// Release runs in reverse resolution order on every exit path, including panics unwinding
/// through the pipeline.
#[derive(Default)]
pub struct HandlerScope {
    releases: Vec<Box<dyn FnOnce() + Send>>,
    scoped: HashMap<String, Box<dyn Any + Send>>,
    stragglers: Stragglers,
}

impl HandlerScope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves an instance according to `lifetime`.
    ///
    /// `key` identifies the registration within this scope for [`Lifetime::Scoped`] sharing.
    pub(crate) fn resolve<H>(
        &mut self,
        key: &str,
        factory: &Arc<dyn HandlerFactory<H>>,
        lifetime: Lifetime,
        singleton: &OnceLock<Arc<H>>,
    ) -> Arc<H>
    where
        H: ?Sized + Send + Sync + 'static,
    {
        match lifetime {
            Lifetime::Singleton => Arc::clone(singleton.get_or_init(|| factory.create())),
            Lifetime::Transient => self.create_tracked(factory),
            Lifetime::Scoped => {
                if let Some(existing) = self
                    .scoped
                    .get(key)
                    .and_then(|boxed| boxed.downcast_ref::<Arc<H>>())
                {
                    return Arc::clone(existing);
                }
                let instance = self.create_tracked(factory);
                self.scoped
                    .insert(key.to_string(), Box::new(Arc::clone(&instance)));
                instance
            }
        }
    }

    fn create_tracked<H>(&mut self, factory: &Arc<dyn HandlerFactory<H>>) -> Arc<H>
    where
        H: ?Sized + Send + Sync + 'static,
    {
        let instance = factory.create();
        let factory = Arc::clone(factory);
        let released = Arc::clone(&instance);
        self.releases
            .push(Box::new(move || factory.release(released)));
        instance
    }

    /// Handle that timeout steps in this pipeline report abandoned work to.
    pub(crate) fn stragglers(&self) -> Stragglers {
        self.stragglers.clone()
    }

    /// Work that must finish before this scope may release its instances.
    pub(crate) fn take_stragglers(&self) -> Vec<BoxFuture<'static, ()>> {
        self.stragglers.take()
    }

    /// Number of instances awaiting release.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.releases.len()
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        self.scoped.clear();
        while let Some(release) = self.releases.pop() {
            release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> &'static str;
    }

    struct Hello;

    impl Greeter for Hello {
        fn greet(&self) -> &'static str {
            "hello"
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicU32,
        released: AtomicU32,
    }

    impl HandlerFactory<dyn Greeter> for CountingFactory {
        fn create(&self) -> Arc<dyn Greeter> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Arc::new(Hello)
        }

        fn release(&self, _instance: Arc<dyn Greeter>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn factory() -> (Arc<CountingFactory>, Arc<dyn HandlerFactory<dyn Greeter>>) {
        let counting = Arc::new(CountingFactory::default());
        let erased: Arc<dyn HandlerFactory<dyn Greeter>> = counting.clone();
        (counting, erased)
    }

    #[test]
    fn transient_instances_are_released_on_drop() {
        let (counting, erased) = factory();
        let singleton = OnceLock::new();
        let mut scope = HandlerScope::new();
        scope.resolve("g", &erased, Lifetime::Transient, &singleton);
        scope.resolve("g", &erased, Lifetime::Transient, &singleton);
        assert_eq!(scope.tracked(), 2);
        drop(scope);
        assert_eq!(counting.created.load(Ordering::SeqCst), 2);
        assert_eq!(counting.released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn scoped_instances_are_shared_within_a_scope() {
        let (counting, erased) = factory();
        let singleton = OnceLock::new();
        let mut scope = HandlerScope::new();
        let a = scope.resolve("g", &erased, Lifetime::Scoped, &singleton);
        let b = scope.resolve("g", &erased, Lifetime::Scoped, &singleton);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.greet(), "hello");
        drop(scope);
        assert_eq!(counting.created.load(Ordering::SeqCst), 1);
        assert_eq!(counting.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn singletons_outlive_scopes() {
        let (counting, erased) = factory();
        let singleton = OnceLock::new();
        for _ in 0..3 {
            let mut scope = HandlerScope::new();
            scope.resolve("g", &erased, Lifetime::Singleton, &singleton);
        }
        assert_eq!(counting.created.load(Ordering::SeqCst), 1);
        assert_eq!(counting.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn release_runs_when_unwinding() {
        let (counting, erased) = factory();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let singleton = OnceLock::new();
            let mut scope = HandlerScope::new();
            scope.resolve("g", &erased, Lifetime::Transient, &singleton);
            panic!("handler blew up");
        }));
        assert!(result.is_err());
        assert_eq!(counting.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closures_are_factories() {
        let erased: Arc<dyn HandlerFactory<dyn Greeter>> =
            Arc::new(|| Arc::new(Hello) as Arc<dyn Greeter>);
        let singleton = OnceLock::new();
        let mut scope = HandlerScope::new();
        assert_eq!(
            scope
                .resolve("g", &erased, Lifetime::Transient, &singleton)
                .greet(),
            "hello"
        );
    }
}
