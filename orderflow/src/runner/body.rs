//! The stage body contract.

use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;

use super::StageContext;

/// The opaque, possibly failing work of one stage.
///
/// Bodies must be idempotent: a queue may deliver the same stage twice.
#[async_trait]
pub trait StageBody: Send + Sync + Debug {
    /// Returns the name of the body, for logs.
    fn name(&self) -> &str;

    /// Runs the stage.
    ///
    /// Bodies report progress through [`StageContext::report`] and should
    /// call [`StageContext::checkpoint`] between units of work.
    async fn run(&self, ctx: &StageContext) -> anyhow::Result<()>;
}

/// An async function-based stage body.
pub struct FnStageBody<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    name: String,
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnStageBody<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    /// Creates a new function-based body.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Debug for FnStageBody<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStageBody").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> StageBody for FnStageBody<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> anyhow::Result<()> {
        (self.func)(ctx.clone()).await
    }
}
