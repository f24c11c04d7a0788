//! Middleware types.

use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::{Context, Error, Result};

/// Middleware that wraps around the remaining middleware chain.
///
/// A middleware may mutate the context, delegate to the rest of the chain
/// through [`Next::run`] at most once, and/or produce a response. Driving
/// the continuation twice from the same frame is a programming error the
/// chain detects as [`Error::InvalidChainUsage`].
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Asynchronously handle the request, delegating to `next` to run the
    /// remainder of the chain.
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()>;

    /// Set the middleware's name. By default it uses the type signature.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl Debug for dyn Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn Middleware<{}>", self.name())
    }
}

#[async_trait]
impl<F> Middleware for F
where
    F: for<'arg> Fn2<&'arg mut Context, Next> + Send + Sync + 'static,
    for<'arg> <F as Fn2<&'arg mut Context, Next>>::Output: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        self(ctx, next).await
    }
}

trait Fn2<Arg1, Arg2>: Fn(Arg1, Arg2) -> <Self as Fn2<Arg1, Arg2>>::Output {
    type Output;
}
impl<F: Fn(Arg1, Arg2) -> O, Arg1, Arg2, O> Fn2<Arg1, Arg2> for F {
    type Output = O;
}

/// The tail of a chain: what runs when the middleware list is exhausted.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Invoke the endpoint within the given context.
    async fn call(&self, ctx: &mut Context) -> Result<()>;
}

/// The remainder of a middleware chain, including the outer continuation.
///
/// `run` consumes the value, so a frame cannot hold on to its
/// continuation; the shared deepest-frame counter additionally guards the
/// chain tail, which nested chains re-enter through [`ChainTail`].
pub struct Next {
    chain: Arc<Vec<Arc<dyn Middleware>>>,
    endpoint: Arc<dyn Endpoint>,
    index: usize,
    deepest: Arc<AtomicUsize>,
}

impl Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("remaining", &self.chain.len().saturating_sub(self.index))
            .finish()
    }
}

impl Next {
    /// Create a new Next instance over an ordered chain, ending in
    /// `endpoint`. Each creation gets its own frame counter, so concurrent
    /// invocations of one composed chain are independent.
    pub fn new(chain: Arc<Vec<Arc<dyn Middleware>>>, endpoint: Arc<dyn Endpoint>) -> Next {
        Next {
            chain,
            endpoint,
            index: 0,
            deepest: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Asynchronously execute the remaining middleware chain.
    pub async fn run(self, ctx: &mut Context) -> Result<()> {
        // the deepest frame entered must advance by exactly one per run
        if self
            .deepest
            .compare_exchange(self.index, self.index + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::InvalidChainUsage);
        }

        match self.chain.get(self.index) {
            // if there is a next middleware, hand it a continuation one frame deeper
            Some(current) => {
                let next = Next {
                    chain: self.chain.clone(),
                    endpoint: self.endpoint.clone(),
                    index: self.index + 1,
                    deepest: self.deepest.clone(),
                };
                current.clone().handle(ctx, next).await
            }
            // if there is no next middleware, execute the outer continuation
            None => self.endpoint.call(ctx).await,
        }
    }
}

/// Adapter that lets an outer continuation serve as the tail of a nested
/// chain. The wrapped `Next` can be taken exactly once; a second take is
/// the runtime-reachable double-`next` and fails the chain.
pub struct ChainTail(Mutex<Option<Next>>);

impl Debug for ChainTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChainTail")
    }
}

impl ChainTail {
    /// Wrap an outer continuation.
    pub fn new(next: Next) -> Self {
        Self(Mutex::new(Some(next)))
    }
}

#[async_trait]
impl Endpoint for ChainTail {
    async fn call(&self, ctx: &mut Context) -> Result<()> {
        let next = self
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match next {
            Some(next) => next.run(ctx).await,
            None => Err(Error::InvalidChainUsage),
        }
    }
}

/// An ordered, named set of middlewares composed into one.
///
/// Stacks back `addModule`: repeated registrations on the same path push
/// onto the same stack, which is installed into the router once and
/// snapshots its list per request. Composition is idempotent; the list is
/// only extended while routes are being bound.
pub struct Stack {
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl Stack {
    pub(crate) fn new() -> Self {
        Self {
            middlewares: RwLock::new(Vec::new()),
        }
    }

    /// Append a middleware to the stack.
    pub fn push(&self, middleware: Arc<dyn Middleware>) {
        self.middlewares
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(middleware);
    }

    /// Number of middlewares currently composed.
    pub fn len(&self) -> usize {
        self.middlewares
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Whether the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stack (length: {})", self.len())
    }
}

#[async_trait]
impl Middleware for Stack {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        let snapshot = Arc::new(
            self.middlewares
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        );
        Next::new(snapshot, Arc::new(ChainTail::new(next))).run(ctx).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::unspecified_peer;
    use std::sync::atomic::AtomicUsize;

    fn ctx() -> Context {
        let req = hyper::Request::builder()
            .uri("/")
            .body(hyper::Body::empty())
            .unwrap();
        Context::from_request(req, unspecified_peer(), false)
    }

    /// An endpoint that ignores the context and succeeds.
    struct Nothing;

    #[async_trait]
    impl Endpoint for Nothing {
        async fn call(&self, _ctx: &mut Context) -> Result<()> {
            Ok(())
        }
    }

    struct Tag(&'static str);

    #[async_trait]
    impl Middleware for Tag {
        async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
            let trace: &mut String = ctx.ext_mut().unwrap();
            trace.push_str(self.0);
            trace.push('>');
            next.run(ctx).await?;
            let trace: &mut String = ctx.ext_mut().unwrap();
            trace.push('<');
            trace.push_str(self.0);
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_in_declaration_order_and_unwinds_in_reverse() {
        let chain: Arc<Vec<Arc<dyn Middleware>>> =
            Arc::new(vec![Arc::new(Tag("a")), Arc::new(Tag("b"))]);
        let mut ctx = ctx();
        ctx.insert_ext(String::new());
        Next::new(chain, Arc::new(Nothing)).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.ext::<String>().unwrap(), "a>b><b<a");
    }

    #[tokio::test]
    async fn empty_chain_calls_endpoint() {
        struct Mark;
        #[async_trait]
        impl Endpoint for Mark {
            async fn call(&self, ctx: &mut Context) -> Result<()> {
                ctx.insert_ext(7u32);
                Ok(())
            }
        }
        let mut ctx = ctx();
        Next::new(Arc::new(Vec::new()), Arc::new(Mark))
            .run(&mut ctx)
            .await
            .unwrap();
        assert_eq!(ctx.ext::<u32>(), Some(&7));
    }

    #[tokio::test]
    async fn re_entering_a_frame_is_invalid_chain_usage() {
        // Two continuations for the same frame share one counter; the
        // second run must fail without invoking anything further.
        let calls = Arc::new(AtomicUsize::new(0));
        struct Count(Arc<AtomicUsize>);
        #[async_trait]
        impl Middleware for Count {
            async fn handle(&self, _ctx: &mut Context, next: Next) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                next.run(_ctx).await
            }
        }

        let chain: Arc<Vec<Arc<dyn Middleware>>> = Arc::new(vec![Arc::new(Count(calls.clone()))]);
        let first = Next::new(chain.clone(), Arc::new(Nothing));
        let duplicate = Next {
            chain,
            endpoint: Arc::new(Nothing),
            index: first.index,
            deepest: first.deepest.clone(),
        };

        let mut ctx = ctx();
        first.run(&mut ctx).await.unwrap();
        let err = duplicate.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, Error::InvalidChainUsage));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chain_tail_is_single_shot() {
        let tail = ChainTail::new(Next::new(Arc::new(Vec::new()), Arc::new(Nothing)));
        let mut ctx = ctx();
        tail.call(&mut ctx).await.unwrap();
        let err = tail.call(&mut ctx).await.unwrap_err();
        assert!(matches!(err, Error::InvalidChainUsage));
    }

    #[tokio::test]
    async fn stack_composes_and_delegates_to_outer_next() {
        let stack = Stack::new();
        stack.push(Arc::new(Tag("s1")));
        stack.push(Arc::new(Tag("s2")));

        let chain: Arc<Vec<Arc<dyn Middleware>>> = Arc::new(vec![Arc::new(stack)]);
        let mut ctx = ctx();
        ctx.insert_ext(String::new());
        Next::new(chain, Arc::new(Nothing)).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.ext::<String>().unwrap(), "s1>s2><s2<s1");
    }
}
