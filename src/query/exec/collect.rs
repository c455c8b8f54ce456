//! `COLLECT`: grouping, counting and duplicate elimination.

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use crate::error::Result;
use crate::query::exec::block::{materialize, Batch, BoxBlock, ExecutionBlock, Row};
use crate::query::exec::ExecContext;
use crate::query::plan::{CollectGroup, CollectMethod};
use crate::query::value::Value;
use crate::types::VarId;

/// `INTO out`: every grouped row is captured as an object keyed by the
/// names of the kept variables.
#[derive(Clone, Debug)]
pub struct CollectCapture {
    /// Variable bound to the captured array.
    pub out: VarId,
    /// Attribute name and variable of each kept binding.
    pub keep: Vec<(String, VarId)>,
}

struct Group {
    first: Row,
    members: Vec<Value>,
    count: u64,
}

/// Groups its whole input on the first pull.
///
/// Rows after the collect carry the bindings of the first row of their group
/// (so variables of enclosing scopes stay visible) plus the group outputs.
pub struct CollectBlock {
    upstream: BoxBlock,
    groups: Vec<CollectGroup>,
    into: Option<CollectCapture>,
    count: Option<VarId>,
    method: CollectMethod,
    seed: Row,
    output: Option<VecDeque<Row>>,
}

impl CollectBlock {
    /// Wraps `upstream`.
    pub fn new(
        upstream: BoxBlock,
        groups: Vec<CollectGroup>,
        into: Option<CollectCapture>,
        count: Option<VarId>,
        method: CollectMethod,
    ) -> Self {
        Self {
            upstream,
            groups,
            into,
            count,
            method,
            seed: Row::new(),
            output: None,
        }
    }

    fn output(&mut self, ctx: &mut ExecContext) -> Result<&mut VecDeque<Row>> {
        if self.output.is_none() {
            let rows = materialize(&mut self.upstream, ctx)?;
            let input_rows = rows.len();
            let grouped = self.group(rows);
            debug!(
                method = self.method.as_str(),
                rows = input_rows,
                groups = grouped.len(),
                "executor.collect.grouped"
            );
            self.output = Some(grouped);
        }
        Ok(self.output.get_or_insert_with(VecDeque::new))
    }

    fn capture(&self, row: &Row) -> Option<Value> {
        let into = self.into.as_ref()?;
        let object = into
            .keep
            .iter()
            .filter_map(|(name, var)| row.get(var).map(|value| (name.clone(), value.clone())))
            .collect();
        Some(Value::Object(object))
    }

    fn group(&self, rows: Vec<Row>) -> VecDeque<Row> {
        let mut order: Vec<(Vec<Value>, Group)> = Vec::new();
        let mut index: BTreeMap<Vec<Value>, usize> = BTreeMap::new();
        for row in rows {
            let key: Vec<Value> = self
                .groups
                .iter()
                .map(|group| row.get(&group.input).cloned().unwrap_or(Value::Null))
                .collect();
            let member = self.capture(&row);
            match index.get(&key) {
                Some(&slot) => {
                    let group = &mut order[slot].1;
                    group.count += 1;
                    group.members.extend(member);
                }
                None => {
                    index.insert(key.clone(), order.len());
                    order.push((
                        key,
                        Group {
                            first: row,
                            members: member.into_iter().collect(),
                            count: 1,
                        },
                    ));
                }
            }
        }
        // Without group criteria the aggregate exists even for empty input.
        if order.is_empty() && self.groups.is_empty() {
            order.push((
                Vec::new(),
                Group {
                    first: self.seed.clone(),
                    members: Vec::new(),
                    count: 0,
                },
            ));
        }
        if self.method != CollectMethod::Distinct {
            order.sort_by(|a, b| a.0.cmp(&b.0));
        }
        order
            .into_iter()
            .map(|(key, group)| self.emit(key, group))
            .collect()
    }

    fn emit(&self, key: Vec<Value>, group: Group) -> Row {
        let mut row = group.first;
        for (criterion, value) in self.groups.iter().zip(key) {
            row.insert(criterion.out, value);
        }
        if let Some(into) = &self.into {
            row.insert(into.out, Value::Array(group.members));
        }
        if let Some(count) = self.count {
            row.insert(count, Value::Int(group.count as i64));
        }
        row
    }
}

impl ExecutionBlock for CollectBlock {
    fn initialize(&mut self, input: &Row) -> Result<()> {
        self.seed = input.clone();
        self.output = None;
        self.upstream.initialize(input)
    }

    fn produce(&mut self, ctx: &mut ExecContext, at_most: usize) -> Result<Batch> {
        let output = self.output(ctx)?;
        let take = at_most.min(output.len());
        let rows: Vec<Row> = output.drain(..take).collect();
        Ok(Batch {
            rows,
            has_more: !output.is_empty(),
        })
    }

    fn skip(&mut self, ctx: &mut ExecContext, n: u64) -> Result<u64> {
        let output = self.output(ctx)?;
        let take = n.min(output.len() as u64) as usize;
        output.drain(..take);
        Ok(take as u64)
    }

    fn release(&mut self) {
        self.output = None;
        self.upstream.release();
    }
}
