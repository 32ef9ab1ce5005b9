//! Named pipeline steps and the copy-on-write pipeline that orders them.
//!
//! A [`Pipeline`] is built once when the proxy is created and can only grow,
//! through name-relative insertion. Every dispatch takes a snapshot of the
//! pass list before running it, so an insertion never changes the passes of
//! a dispatch that is already in flight.

use arc_swap::ArcSwap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::trace;

use crate::error::ProxyError;
use crate::proxy::ProxyServer;

/// Per-dispatch state threaded through the passes of one protocol.
pub trait PassContext: Send {
    /// Value produced by the pass that completes the dispatch.
    type Output: Send;
}

/// What a pass tells the pipeline after it ran.
#[derive(Debug)]
pub enum Flow<T> {
    /// Run the next pass.
    Continue,
    /// The dispatch is handled; skip every remaining pass.
    Done(T),
}

/// Boxed future returned by [`Pass::run`].
pub type PassFuture<'a, T> = Pin<Box<dyn Future<Output = Result<Flow<T>, ProxyError>> + Send + 'a>>;

/// One named step of a pipeline.
///
/// Passes are stateless: anything they need travels through the context or
/// the proxy they are handed.
pub trait Pass<C: PassContext>: Send + Sync {
    /// Registration name, used as an insertion anchor.
    fn name(&self) -> &str;

    fn run<'a>(&'a self, ctx: &'a mut C, proxy: &'a ProxyServer) -> PassFuture<'a, C::Output>;
}

/// A pass backed by a plain function, used for the built-in passes.
pub(crate) struct StaticPass<C: PassContext> {
    name: &'static str,
    run: for<'a> fn(&'a mut C, &'a ProxyServer) -> PassFuture<'a, C::Output>,
}

impl<C: PassContext> StaticPass<C> {
    pub(crate) fn new(
        name: &'static str,
        run: for<'a> fn(&'a mut C, &'a ProxyServer) -> PassFuture<'a, C::Output>,
    ) -> Arc<dyn Pass<C>>
    where
        C: 'static,
    {
        Arc::new(Self { name, run })
    }
}

impl<C: PassContext> Pass<C> for StaticPass<C> {
    fn name(&self) -> &str {
        self.name
    }

    fn run<'a>(&'a self, ctx: &'a mut C, proxy: &'a ProxyServer) -> PassFuture<'a, C::Output> {
        (self.run)(ctx, proxy)
    }
}

/// A synchronous pass built from a closure. See [`pass_fn`].
pub struct FnPass<F> {
    name: String,
    f: F,
}

/// Build a pass from a synchronous closure.
///
/// # Example
///
/// ```rust
/// use axum_pass_proxy::{pass_fn, Flow, Placement, ProxyOptions, ProxyServer, WebContext};
/// use http::HeaderValue;
///
/// let proxy = ProxyServer::new(ProxyOptions::new().with_target("http://127.0.0.1:3000"));
/// proxy
///     .insert_web_pass(
///         Placement::Before("stream"),
///         pass_fn("tag", |ctx: &mut WebContext, _proxy: &ProxyServer| {
///             ctx.req
///                 .headers
///                 .insert("x-tagged", HeaderValue::from_static("1"));
///             Ok(Flow::Continue)
///         }),
///     )
///     .unwrap();
/// ```
pub fn pass_fn<C, F>(name: impl Into<String>, f: F) -> FnPass<F>
where
    C: PassContext,
    F: Fn(&mut C, &ProxyServer) -> Result<Flow<C::Output>, ProxyError> + Send + Sync,
{
    FnPass {
        name: name.into(),
        f,
    }
}

impl<C, F> Pass<C> for FnPass<F>
where
    C: PassContext,
    F: Fn(&mut C, &ProxyServer) -> Result<Flow<C::Output>, ProxyError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(&'a self, ctx: &'a mut C, proxy: &'a ProxyServer) -> PassFuture<'a, C::Output> {
        Box::pin(std::future::ready((self.f)(ctx, proxy)))
    }
}

/// Where to insert a pass relative to an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement<'a> {
    Before(&'a str),
    After(&'a str),
}

impl Placement<'_> {
    fn anchor(&self) -> &str {
        match self {
            Placement::Before(name) | Placement::After(name) => name,
        }
    }
}

type PassList<C> = Vec<Arc<dyn Pass<C>>>;

/// Ordered, runtime-extensible list of passes for one protocol.
pub struct Pipeline<C: PassContext> {
    passes: ArcSwap<PassList<C>>,
}

impl<C: PassContext> Pipeline<C> {
    pub(crate) fn new(passes: PassList<C>) -> Self {
        Self {
            passes: ArcSwap::from_pointee(passes),
        }
    }

    /// The current pass list. Later insertions do not affect it.
    pub fn snapshot(&self) -> Arc<PassList<C>> {
        self.passes.load_full()
    }

    pub fn names(&self) -> Vec<String> {
        self.passes
            .load()
            .iter()
            .map(|pass| pass.name().to_string())
            .collect()
    }

    /// Insert `pass` next to the first pass named by `placement`.
    ///
    /// Fails with [`ProxyError::PassNotFound`] and leaves the pipeline
    /// untouched when no pass has that name.
    pub fn insert(&self, placement: Placement<'_>, pass: Arc<dyn Pass<C>>) -> Result<(), ProxyError> {
        let anchor = placement.anchor();
        let mut found = false;
        self.passes.rcu(|current| {
            let mut next = PassList::clone(current);
            found = false;
            if let Some(index) = next.iter().position(|p| p.name() == anchor) {
                found = true;
                let at = match placement {
                    Placement::Before(_) => index,
                    Placement::After(_) => index + 1,
                };
                next.insert(at, pass.clone());
            }
            next
        });

        if found {
            trace!(pass = pass.name(), ?placement, "inserted pass");
            Ok(())
        } else {
            Err(ProxyError::PassNotFound {
                name: anchor.to_string(),
            })
        }
    }

    /// Run a snapshot of the pipeline until a pass reports [`Flow::Done`].
    ///
    /// Returns `None` when every pass ran without finishing the dispatch.
    pub(crate) async fn run(
        &self,
        ctx: &mut C,
        proxy: &ProxyServer,
    ) -> Result<Option<C::Output>, ProxyError> {
        let passes = self.snapshot();
        for pass in passes.iter() {
            trace!(pass = pass.name(), "running pass");
            if let Flow::Done(output) = pass.run(ctx, proxy).await? {
                trace!(pass = pass.name(), "pass finished the dispatch");
                return Ok(Some(output));
            }
        }
        Ok(None)
    }
}

impl<C: PassContext> fmt::Debug for Pipeline<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ProxyOptions;
    use std::sync::Mutex;

    struct Recorder {
        seen: Vec<String>,
    }

    impl PassContext for Recorder {
        type Output = &'static str;
    }

    fn recording(name: &'static str) -> Arc<dyn Pass<Recorder>> {
        Arc::new(pass_fn(name, move |ctx: &mut Recorder, _: &ProxyServer| {
            ctx.seen.push(name.to_string());
            Ok(Flow::Continue)
        }))
    }

    fn pipeline() -> Pipeline<Recorder> {
        Pipeline::new(vec![recording("a"), recording("b"), recording("c")])
    }

    fn proxy() -> ProxyServer {
        ProxyServer::new(ProxyOptions::new().with_target("http://127.0.0.1:1"))
    }

    #[test]
    fn inserts_before_and_after_anchor() {
        let pipeline = pipeline();
        pipeline
            .insert(Placement::Before("b"), recording("before-b"))
            .unwrap();
        pipeline
            .insert(Placement::After("b"), recording("after-b"))
            .unwrap();
        pipeline
            .insert(Placement::After("c"), recording("last"))
            .unwrap();
        assert_eq!(
            pipeline.names(),
            vec!["a", "before-b", "b", "after-b", "c", "last"]
        );
    }

    #[test]
    fn insertion_targets_first_match() {
        let pipeline = Pipeline::new(vec![recording("x"), recording("x")]);
        pipeline.insert(Placement::After("x"), recording("y")).unwrap();
        assert_eq!(pipeline.names(), vec!["x", "y", "x"]);
    }

    #[test]
    fn unknown_anchor_leaves_pipeline_unchanged() {
        let pipeline = pipeline();
        let err = pipeline
            .insert(Placement::Before("missing"), recording("z"))
            .unwrap_err();
        assert!(matches!(err, ProxyError::PassNotFound { ref name } if name == "missing"));
        assert_eq!(pipeline.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn snapshot_is_not_affected_by_later_insertions() {
        let pipeline = pipeline();
        let snapshot = pipeline.snapshot();
        pipeline.insert(Placement::After("a"), recording("new")).unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(pipeline.snapshot().len(), 4);
    }

    #[tokio::test]
    async fn done_stops_the_pipeline() {
        let pipeline = pipeline();
        pipeline
            .insert(
                Placement::After("a"),
                Arc::new(pass_fn("stop", |_: &mut Recorder, _: &ProxyServer| {
                    Ok(Flow::Done("stopped"))
                })),
            )
            .unwrap();

        let mut ctx = Recorder { seen: Vec::new() };
        let output = pipeline.run(&mut ctx, &proxy()).await.unwrap();
        assert_eq!(output, Some("stopped"));
        assert_eq!(ctx.seen, vec!["a"]);
    }

    #[tokio::test]
    async fn errors_abort_the_run() {
        let ran_after = Arc::new(Mutex::new(false));
        let flag = ran_after.clone();
        let pipeline: Pipeline<Recorder> = Pipeline::new(vec![
            Arc::new(pass_fn("fail", |_: &mut Recorder, _: &ProxyServer| {
                Err(ProxyError::NoResponse)
            })),
            Arc::new(pass_fn("after", move |_: &mut Recorder, _: &ProxyServer| {
                *flag.lock().unwrap() = true;
                Ok(Flow::Continue)
            })),
        ]);

        let mut ctx = Recorder { seen: Vec::new() };
        let err = pipeline.run(&mut ctx, &proxy()).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoResponse));
        assert!(!*ran_after.lock().unwrap());
    }
}
