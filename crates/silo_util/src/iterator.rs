//! Generic paginated traversal.
//!
//! An [`Iterate`] implementation fills the next page into an output and the
//! input's continuation state advances from each page; [`merged`] drains
//! pages into one accumulated output until it reports done.

use async_trait::async_trait;

/// Continuation state fed to an [`Iterate`] implementation.
pub trait PageIn<O>: Send {
    /// Advance the continuation from the page just produced.
    fn update(&mut self, page: &O);
}

/// Accumulated output of a paginated traversal.
pub trait PageOut: Default + Send {
    /// Whether the traversal has produced everything it was asked for.
    fn done(&self) -> bool;
    /// Fold one page into the accumulated output.
    fn merge(&mut self, page: Self);
}

/// Produces one page per call, writing it into `out`.
#[async_trait]
pub trait Iterate<I, O>: Send + Sync
where
    I: PageIn<O>,
    O: PageOut,
{
    async fn next_page(&self, input: &I, out: &mut O) -> anyhow::Result<()>;
}

#[async_trait]
impl<I, O, F> Iterate<I, O> for F
where
    I: PageIn<O> + Sync,
    O: PageOut,
    F: Fn(&I, &mut O) -> anyhow::Result<()> + Send + Sync,
{
    async fn next_page(&self, input: &I, out: &mut O) -> anyhow::Result<()> {
        self(input, out)
    }
}

/// Run `iterate` until `out` is done, merging every page.
pub async fn merged<I, O>(
    iterate: &dyn Iterate<I, O>,
    input: &mut I,
    out: &mut O,
) -> anyhow::Result<()>
where
    I: PageIn<O> + Sync,
    O: PageOut,
{
    loop {
        let mut page = O::default();
        iterate.next_page(input, &mut page).await?;
        input.update(&page);
        out.merge(page);
        if out.done() {
            return Ok(());
        }
    }
}

/// Step-at-a-time variant of [`merged`] for callers that inspect each page.
pub struct PageIterator<'a, I, O>
where
    I: PageIn<O>,
    O: PageOut,
{
    iterate: &'a dyn Iterate<I, O>,
    input: I,
    out: O,
    failed: bool,
}

impl<'a, I, O> PageIterator<'a, I, O>
where
    I: PageIn<O> + Sync,
    O: PageOut,
{
    pub fn new(iterate: &'a dyn Iterate<I, O>, input: I) -> Self {
        Self {
            iterate,
            input,
            out: O::default(),
            failed: false,
        }
    }

    /// Produce the next page. Returns `false` when the traversal is done
    /// or a previous call failed.
    pub async fn next(&mut self) -> anyhow::Result<bool> {
        if self.failed || self.out.done() {
            return Ok(false);
        }
        let mut page = O::default();
        if let Err(err) = self.iterate.next_page(&self.input, &mut page).await {
            self.failed = true;
            return Err(err);
        }
        self.input.update(&page);
        self.out.merge(page);
        Ok(true)
    }

    pub fn input(&self) -> &I {
        &self.input
    }

    pub fn output(&self) -> &O {
        &self.out
    }
}
