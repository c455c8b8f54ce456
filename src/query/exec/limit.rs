//! `LIMIT offset, limit` with optional full counting.
//!
//! The block moves through four states. While filling it skips the offset;
//! while emitting it passes rows through until the limit is used up; while
//! draining it skips the rest of its input so the full count covers every
//! match. Only the outermost limit of a query drains.

use tracing::trace;

use crate::error::Result;
use crate::query::exec::block::{Batch, BoxBlock, ExecutionBlock, Row};
use crate::query::exec::ExecContext;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LimitState {
    Filling,
    Emitting,
    Draining,
    Done,
}

/// Offset/limit window over its upstream.
pub struct LimitBlock {
    upstream: BoxBlock,
    offset: u64,
    limit: u64,
    full_count: bool,
    state: LimitState,
    remaining: u64,
    /// Rows skipped, emitted and drained in the current run.
    counted: u64,
}

impl LimitBlock {
    /// Wraps `upstream`. With `full_count`, the block drains its input once
    /// the window is served and reports every row it saw.
    pub fn new(upstream: BoxBlock, offset: u64, limit: u64, full_count: bool) -> Self {
        Self {
            upstream,
            offset,
            limit,
            full_count,
            state: LimitState::Filling,
            remaining: limit,
            counted: 0,
        }
    }

    fn transition(&mut self, next: LimitState) {
        trace!(from = ?self.state, to = ?next, counted = self.counted, "executor.limit.state");
        self.state = next;
    }

    fn fill(&mut self, ctx: &mut ExecContext) -> Result<()> {
        let timer = profile_timer();
        let skipped = if self.offset > 0 {
            self.upstream.skip(ctx, self.offset)?
        } else {
            0
        };
        record_profile_timer(QueryProfileKind::Skip, timer);
        self.counted += skipped;
        if skipped < self.offset {
            self.finish(ctx);
        } else if self.remaining == 0 {
            self.drain(ctx)?;
        } else {
            self.transition(LimitState::Emitting);
        }
        Ok(())
    }

    fn drain(&mut self, ctx: &mut ExecContext) -> Result<()> {
        if !self.full_count {
            self.finish(ctx);
            return Ok(());
        }
        self.transition(LimitState::Draining);
        let step = ctx.batch_size().max(1) as u64;
        loop {
            ctx.check_abort()?;
            let timer = profile_timer();
            let skipped = self.upstream.skip(ctx, step)?;
            record_profile_timer(QueryProfileKind::Skip, timer);
            self.counted += skipped;
            if skipped < step {
                break;
            }
        }
        self.finish(ctx);
        Ok(())
    }

    fn finish(&mut self, ctx: &mut ExecContext) {
        if self.full_count {
            ctx.stats.full_count += self.counted;
        }
        self.transition(LimitState::Done);
    }

    /// Accounts for `served` rows; returns `false` once the window or the
    /// input ran out.
    fn served(&mut self, ctx: &mut ExecContext, served: u64, upstream_done: bool) -> Result<bool> {
        self.remaining -= served;
        self.counted += served;
        if upstream_done {
            self.finish(ctx);
            return Ok(false);
        }
        if self.remaining == 0 {
            self.drain(ctx)?;
            return Ok(false);
        }
        Ok(true)
    }
}

impl ExecutionBlock for LimitBlock {
    fn initialize(&mut self, input: &Row) -> Result<()> {
        self.state = LimitState::Filling;
        self.remaining = self.limit;
        self.counted = 0;
        self.upstream.initialize(input)
    }

    fn produce(&mut self, ctx: &mut ExecContext, at_most: usize) -> Result<Batch> {
        loop {
            match self.state {
                LimitState::Filling => self.fill(ctx)?,
                LimitState::Draining => self.drain(ctx)?,
                LimitState::Done => return Ok(Batch::done()),
                LimitState::Emitting => {
                    let want = (at_most as u64).min(self.remaining) as usize;
                    if want == 0 {
                        return Ok(Batch {
                            rows: Vec::new(),
                            has_more: true,
                        });
                    }
                    let batch = self.upstream.produce(ctx, want)?;
                    let has_more =
                        self.served(ctx, batch.rows.len() as u64, !batch.has_more)?;
                    return Ok(Batch {
                        rows: batch.rows,
                        has_more,
                    });
                }
            }
        }
    }

    fn skip(&mut self, ctx: &mut ExecContext, n: u64) -> Result<u64> {
        loop {
            match self.state {
                LimitState::Filling => self.fill(ctx)?,
                LimitState::Draining => self.drain(ctx)?,
                LimitState::Done => return Ok(0),
                LimitState::Emitting => {
                    let want = n.min(self.remaining);
                    if want == 0 {
                        return Ok(0);
                    }
                    let skipped = self.upstream.skip(ctx, want)?;
                    self.served(ctx, skipped, skipped < want)?;
                    return Ok(skipped);
                }
            }
        }
    }

    fn release(&mut self) {
        self.upstream.release();
    }
}
