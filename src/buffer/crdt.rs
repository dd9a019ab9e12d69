//! Sequence CRDT over runs of characters.
//!
//! Every character ever inserted has a globally unique [`OpId`] and remembers
//! the neighbours it was typed between (its left and right *origins*).
//! Characters typed together are stored as one [`Item`]: a run of consecutive
//! identifiers where each character is anchored after its predecessor. A run
//! splits when an edit lands inside it and merges back with its neighbour
//! when both line up again, so a paste stays one item however long it is.
//! Deleting only marks characters as tombstones, so a concurrent insertion
//! anchored to them still finds its place.
//!
//! Concurrent insertions between the same origins are ordered by identifier,
//! greater after smaller; the scan in [`Replica::place`] follows the YATA rules
//! so every replica derives the same order whatever the delivery order.
//!
//! Each [`Operation`] carries its author's [`VersionVector`] at issue time.
//! An operation is integrated only once the local version covers that marker,
//! otherwise it is parked. Operations already covered are duplicates and are
//! ignored, which makes integration idempotent.
//!
//! Tombstones are removed by [`Replica::compact`] once both their insertion
//! and deletion are covered by a watermark every member has acknowledged.
//! Removed identifiers forward to their surviving neighbours so late
//! references still resolve.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;
use uuid::Uuid;

use super::change::TextChange;
use crate::error::IntegrityError;

/// Globally unique identifier of one character (or of one deletion).
///
/// Ordered by author first, then by sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub author: Uuid,
    pub seq: u64,
}

impl OpId {
    pub fn new(author: Uuid, seq: u64) -> Self {
        Self { author, seq }
    }

    /// The identifier `by` sequence numbers later, if it exists
    pub fn checked_offset(self, by: u64) -> Option<Self> {
        self.seq.checked_add(by).map(|seq| Self::new(self.author, seq))
    }

    /// Only for ranges already known to fit
    fn offset(self, by: u64) -> Self {
        Self::new(self.author, self.seq.saturating_add(by))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.author, self.seq)
    }
}

/// `len` consecutive identifiers of one author, starting at `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdRange {
    pub start: OpId,
    pub len: u64,
}

impl IdRange {
    pub fn new(start: OpId, len: u64) -> Self {
        Self { start, len }
    }

    pub fn single(id: OpId) -> Self {
        Self::new(id, 1)
    }

    pub fn last(&self) -> OpId {
        self.start.offset(self.len.saturating_sub(1))
    }

    pub fn contains(&self, id: &OpId) -> bool {
        id.author == self.start.author && id.seq >= self.start.seq && id.seq - self.start.seq < self.len
    }

    fn is_valid(&self) -> bool {
        self.len > 0 && self.start.seq > 0 && self.start.checked_offset(self.len - 1).is_some()
    }
}

/// Highest sequence number integrated per author
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<Uuid, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, author: &Uuid) -> u64 {
        self.0.get(author).copied().unwrap_or(0)
    }

    /// Whether the identifier has been integrated
    pub fn contains(&self, id: &OpId) -> bool {
        self.get(&id.author) >= id.seq
    }

    /// Whether every entry of `other` is covered
    pub fn covers(&self, other: &VersionVector) -> bool {
        other.0.iter().all(|(author, seq)| self.get(author) >= *seq)
    }

    /// Raise the entry for `author` to at least `seq`
    pub fn observe(&mut self, author: Uuid, seq: u64) {
        let entry = self.0.entry(author).or_insert(0);
        if *entry < seq {
            *entry = seq;
        }
    }

    /// Pointwise maximum
    pub fn merge(&mut self, other: &VersionVector) {
        for (author, seq) in &other.0 {
            self.observe(*author, *seq);
        }
    }

    /// Pointwise minimum: what both sides have integrated
    pub fn meet(&self, other: &VersionVector) -> VersionVector {
        VersionVector(
            self.0
                .iter()
                .filter_map(|(author, seq)| {
                    let common = (*seq).min(other.get(author));
                    (common > 0).then_some((*author, common))
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|seq| *seq == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &u64)> {
        self.0.iter()
    }
}

impl FromIterator<(Uuid, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (Uuid, u64)>>(iter: I) -> Self {
        let mut version = VersionVector::new();
        for (author, seq) in iter {
            version.observe(author, seq);
        }
        version
    }
}

/// Operation payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// A run of characters. Character `k` gets sequence `id.seq + k` and is
    /// anchored after character `k - 1`; all share `origin_right`.
    Insert {
        origin_left: Option<OpId>,
        origin_right: Option<OpId>,
        content: String,
    },
    /// Tombstone every character in the listed ranges. Consumes one
    /// sequence number.
    Delete { targets: Vec<IdRange> },
}

/// A replicated edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    /// Author's version when the operation was issued
    pub version: VersionVector,
    pub kind: OpKind,
}

impl Operation {
    pub fn author(&self) -> Uuid {
        self.id.author
    }

    /// Number of sequence numbers consumed
    pub fn span(&self) -> u64 {
        match &self.kind {
            OpKind::Insert { content, .. } => content.chars().count() as u64,
            OpKind::Delete { .. } => 1,
        }
    }

    /// Identifier of the last sequence number consumed
    pub fn last(&self) -> OpId {
        self.id.offset(self.span().saturating_sub(1))
    }

    /// Identifiers that must be integrated first. Covering the last
    /// identifier of a range covers all of it.
    fn references(&self) -> Vec<OpId> {
        match &self.kind {
            OpKind::Insert {
                origin_left,
                origin_right,
                ..
            } => origin_left.iter().chain(origin_right.iter()).copied().collect(),
            OpKind::Delete { targets } => targets.iter().map(IdRange::last).collect(),
        }
    }

    fn validate(&self) -> Result<(), IntegrityError> {
        let malformed = |reason: &str| IntegrityError::Malformed {
            op: self.id,
            reason: reason.to_string(),
        };

        if self.id.seq == 0 {
            return Err(malformed("sequence numbers start at 1"));
        }
        if self.version.get(&self.id.author) != self.id.seq - 1 {
            return Err(malformed("causal marker disagrees with its own sequence"));
        }
        match &self.kind {
            OpKind::Insert { content, .. } if content.is_empty() => {
                return Err(malformed("empty insertion"))
            }
            OpKind::Delete { targets } if targets.is_empty() => {
                return Err(malformed("deletion without targets"))
            }
            OpKind::Delete { targets } if !targets.iter().all(IdRange::is_valid) => {
                return Err(malformed("invalid target range"))
            }
            _ => {}
        }
        if self.id.checked_offset(self.span() - 1).is_none() {
            return Err(malformed("sequence numbers overflow"));
        }
        if let Some(missing) = self
            .references()
            .into_iter()
            .find(|id| !self.version.contains(id))
        {
            return Err(IntegrityError::Malformed {
                op: self.id,
                reason: format!("references {} outside its causal past", missing),
            });
        }
        Ok(())
    }
}

/// A run of characters, visible or tombstoned.
///
/// Character `k` has identifier `id.seq + k`. Every character after the
/// first is anchored to its predecessor; all share `origin_right` and the
/// tombstone state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: OpId,
    pub origin_left: Option<OpId>,
    pub origin_right: Option<OpId>,
    pub content: Vec<char>,
    /// Deletion that tombstoned this run
    pub deleted_by: Option<OpId>,
}

impl Item {
    pub fn is_visible(&self) -> bool {
        self.deleted_by.is_none()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn last(&self) -> OpId {
        self.id.offset(self.len().saturating_sub(1) as u64)
    }

    pub fn range(&self) -> IdRange {
        IdRange::new(self.id, self.len() as u64)
    }

    fn visible_len(&self) -> usize {
        if self.is_visible() {
            self.len()
        } else {
            0
        }
    }

    /// Position of `id` inside the run
    fn index_of(&self, id: &OpId) -> Option<usize> {
        self.range().contains(id).then(|| (id.seq - self.id.seq) as usize)
    }

    /// Cut the run before character `at`, returning the tail
    fn split_off(&mut self, at: usize) -> Item {
        let id = self.id.offset(at as u64);
        Item {
            id,
            origin_left: Some(self.id.offset(at as u64 - 1)),
            origin_right: self.origin_right,
            content: self.content.split_off(at),
            deleted_by: self.deleted_by,
        }
    }

    /// Whether `next` is the continuation of this run
    fn continues(&self, next: &Item) -> bool {
        next.id.author == self.id.author
            && self.last().seq.checked_add(1) == Some(next.id.seq)
            && next.origin_left == Some(self.last())
            && next.origin_right == self.origin_right
            && next.deleted_by == self.deleted_by
    }
}

/// Merge neighbouring runs that continue one another
fn coalesce(items: Vec<Item>) -> Vec<Item> {
    let mut merged: Vec<Item> = Vec::with_capacity(items.len());
    for item in items {
        match merged.last_mut() {
            Some(last) if last.continues(&item) => last.content.extend(item.content),
            _ => merged.push(item),
        }
    }
    merged
}

/// Where a compacted identifier now points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forward {
    pub left: Option<OpId>,
    pub right: Option<OpId>,
}

/// Full replica state, as shipped by the authority on resync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub items: Vec<Item>,
    pub version: VersionVector,
    pub forwards: Vec<(IdRange, Forward)>,
}

impl ReplicaSnapshot {
    pub fn text(&self) -> String {
        self.items
            .iter()
            .filter(|i| i.is_visible())
            .flat_map(|i| i.content.iter())
            .collect()
    }
}

/// Outcome of integrating a remote operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Already integrated; nothing changed
    Duplicate,
    /// Waiting for causal dependencies
    Parked,
    /// Integrated, together with any parked operations it unblocked
    Integrated {
        /// In integration order, the applied operation first
        ops: Vec<Operation>,
        /// Sequential: each is expressed in the coordinates left by the
        /// previous one
        changes: Vec<TextChange>,
    },
}

/// A local copy of one buffer's sequence
#[derive(Debug, Clone)]
pub struct Replica {
    site: Uuid,
    items: Vec<Item>,
    visible: usize,
    version: VersionVector,
    /// Compacted ranges keyed by their first identifier
    forwards: BTreeMap<OpId, (u64, Forward)>,
    pending: Vec<Operation>,
    max_pending: usize,
}

impl Replica {
    pub fn new(site: Uuid) -> Self {
        Self {
            site,
            items: Vec::new(),
            visible: 0,
            version: VersionVector::new(),
            forwards: BTreeMap::new(),
            pending: Vec::new(),
            max_pending: usize::MAX,
        }
    }

    pub fn from_snapshot(site: Uuid, snapshot: ReplicaSnapshot) -> Self {
        let items: Vec<Item> = snapshot.items.into_iter().filter(|i| !i.is_empty()).collect();
        Self {
            site,
            visible: items.iter().map(Item::visible_len).sum(),
            items,
            version: snapshot.version,
            forwards: snapshot
                .forwards
                .into_iter()
                .map(|(range, forward)| (range.start, (range.len, forward)))
                .collect(),
            pending: Vec::new(),
            max_pending: usize::MAX,
        }
    }

    /// Bound the number of parked operations before reporting a stall
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    pub fn site(&self) -> Uuid {
        self.site
    }

    pub fn version(&self) -> &VersionVector {
        &self.version
    }

    /// Visible text
    pub fn text(&self) -> String {
        self.items
            .iter()
            .filter(|i| i.is_visible())
            .flat_map(|i| i.content.iter())
            .collect()
    }

    /// Visible character count
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    /// Tombstoned character count
    pub fn tombstones(&self) -> usize {
        self.items.iter().filter(|i| !i.is_visible()).map(Item::len).sum()
    }

    /// Stored runs, visible or not
    pub fn runs(&self) -> usize {
        self.items.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop every parked operation, returning how many there were
    pub fn discard_pending(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Drop the parked operations of one author, returning how many there were
    pub fn discard_pending_from(&mut self, author: &Uuid) -> usize {
        let before = self.pending.len();
        self.pending.retain(|p| p.author() != *author);
        before - self.pending.len()
    }

    pub fn snapshot(&self) -> ReplicaSnapshot {
        ReplicaSnapshot {
            items: coalesce(self.items.clone()),
            version: self.version.clone(),
            forwards: self
                .forwards
                .iter()
                .map(|(start, (len, forward))| (IdRange::new(*start, *len), *forward))
                .collect(),
        }
    }

    /// Turn a local edit into operations and apply them immediately.
    ///
    /// The span is clamped to the current text. Returns the operations to
    /// replicate: at most one deletion followed by at most one insertion.
    pub fn local_change(&mut self, change: &TextChange) -> Vec<Operation> {
        let span = change.clamped(self.len());
        let mut ops = Vec::with_capacity(2);

        if !span.is_empty() {
            let op = Operation {
                id: self.next_id(),
                version: self.version.clone(),
                kind: OpKind::Delete {
                    targets: self.visible_ranges(span.clone()),
                },
            };
            self.integrate_delete(&op);
            ops.push(op);
        }

        if !change.content.is_empty() {
            let (origin_left, origin_right) = self.anchors(span.start);
            let op = Operation {
                id: self.next_id(),
                version: self.version.clone(),
                kind: OpKind::Insert {
                    origin_left,
                    origin_right,
                    content: change.content.clone(),
                },
            };
            match self.integrate_insert(&op, origin_left, origin_right, &change.content) {
                Ok(_) => ops.push(op),
                // Anchors come from our own items and always resolve
                Err(err) => tracing::error!("Local insertion {} failed to integrate: {}", op.id, err),
            }
        }

        ops
    }

    /// Integrate a remote (or replayed) operation.
    ///
    /// Duplicates are ignored, operations whose causal marker is not yet
    /// covered are parked, and integrating one operation retries the parked
    /// ones it may have unblocked.
    pub fn apply(&mut self, op: Operation) -> Result<Applied, IntegrityError> {
        op.validate()?;

        if self.version.contains(&op.last()) {
            return Ok(Applied::Duplicate);
        }
        if self.version.contains(&op.id) {
            return Err(IntegrityError::Malformed {
                op: op.id,
                reason: "overlaps operations already integrated".to_string(),
            });
        }

        if !self.is_ready(&op) {
            if self.pending.iter().any(|p| p.id == op.id) {
                return Ok(Applied::Parked);
            }
            self.pending.push(op);
            if self.pending.len() > self.max_pending {
                return Err(IntegrityError::Stalled(self.pending.len()));
            }
            return Ok(Applied::Parked);
        }

        let mut changes = self.integrate(&op)?;
        let mut ops = vec![op];

        while let Some(index) = self.pending.iter().position(|p| self.is_ready(p)) {
            let parked = self.pending.swap_remove(index);
            changes.extend(self.integrate(&parked)?);
            ops.push(parked);
        }
        self.pending.retain(|p| !self.version.contains(&p.last()));

        Ok(Applied::Integrated { ops, changes })
    }

    /// Remove tombstones whose insertion and deletion are both covered by
    /// `watermark`. Returns how many characters were dropped.
    pub fn compact(&mut self, watermark: &VersionVector) -> usize {
        let removable = |item: &Item| {
            watermark.contains(&item.last())
                && item.deleted_by.map_or(false, |d| watermark.contains(&d))
        };

        let keep: Vec<bool> = self.items.iter().map(|i| !removable(i)).collect();
        if keep.iter().all(|k| *k) {
            return 0;
        }

        let mut next_kept = vec![None; self.items.len()];
        let mut right = None;
        for (index, item) in self.items.iter().enumerate().rev() {
            next_kept[index] = right;
            if keep[index] {
                right = Some(item.id);
            }
        }

        let mut left = None;
        let mut removed = 0;
        for (index, item) in self.items.iter().enumerate() {
            if keep[index] {
                left = Some(item.last());
            } else {
                removed += item.len();
                self.forwards.insert(
                    item.id,
                    (
                        item.len() as u64,
                        Forward {
                            left,
                            right: next_kept[index],
                        },
                    ),
                );
            }
        }

        let mut index = 0;
        self.items.retain(|_| {
            let kept = keep[index];
            index += 1;
            kept
        });
        self.items = coalesce(std::mem::take(&mut self.items));

        removed
    }

    fn next_id(&self) -> OpId {
        OpId::new(self.site, self.version.get(&self.site).saturating_add(1))
    }

    fn is_ready(&self, op: &Operation) -> bool {
        self.version.covers(&op.version) && self.version.get(&op.id.author) == op.id.seq - 1
    }

    /// Identifiers of the characters on either side of visible offset `at`
    fn anchors(&self, at: usize) -> (Option<OpId>, Option<OpId>) {
        if at == 0 {
            return (None, self.items.first().map(|i| i.id));
        }
        let mut seen = 0;
        for (index, item) in self.items.iter().enumerate() {
            if !item.is_visible() {
                continue;
            }
            if seen + item.len() >= at {
                let k = at - seen - 1;
                let right = if k + 1 < item.len() {
                    Some(item.id.offset(k as u64 + 1))
                } else {
                    self.items.get(index + 1).map(|i| i.id)
                };
                return (Some(item.id.offset(k as u64)), right);
            }
            seen += item.len();
        }
        (self.items.last().map(Item::last), None)
    }

    /// Identifier ranges of the visible characters in `span`
    fn visible_ranges(&self, span: Range<usize>) -> Vec<IdRange> {
        let mut ranges: Vec<IdRange> = Vec::new();
        let mut seen = 0;
        for item in self.items.iter().filter(|i| i.is_visible()) {
            let start = seen;
            seen += item.len();
            if seen <= span.start {
                continue;
            }
            if start >= span.end {
                break;
            }
            let from = span.start.max(start) - start;
            let to = span.end.min(seen) - start;
            let range = IdRange::new(item.id.offset(from as u64), (to - from) as u64);
            match ranges.last_mut() {
                Some(last)
                    if last.start.author == range.start.author
                        && last.last().seq.checked_add(1) == Some(range.start.seq) =>
                {
                    last.len += range.len
                }
                _ => ranges.push(range),
            }
        }
        ranges
    }

    /// Run holding `id` and the position inside it
    fn find(&self, id: &OpId) -> Option<(usize, usize)> {
        self.items
            .iter()
            .enumerate()
            .find_map(|(index, item)| item.index_of(id).map(|at| (index, at)))
    }

    fn forward(&self, id: &OpId) -> Option<&Forward> {
        let (start, (len, forward)) = self.forwards.range(..=*id).next_back()?;
        IdRange::new(*start, *len).contains(id).then_some(forward)
    }

    fn is_known(&self, id: &OpId) -> bool {
        self.find(id).is_some() || self.forward(id).is_some()
    }

    /// Make `id` the last character of its run
    fn split_after(&mut self, id: &OpId) {
        if let Some((index, at)) = self.find(id) {
            if at + 1 < self.items[index].len() {
                let tail = self.items[index].split_off(at + 1);
                self.items.insert(index + 1, tail);
            }
        }
    }

    /// Make `id` the first character of its run
    fn split_before(&mut self, id: &OpId) {
        if let Some((index, at)) = self.find(id) {
            if at > 0 {
                let tail = self.items[index].split_off(at);
                self.items.insert(index + 1, tail);
            }
        }
    }

    fn visible_before(&self, index: usize) -> usize {
        self.items[..index].iter().map(Item::visible_len).sum()
    }

    /// Follow forwards until a live character (or a sequence boundary) is reached
    fn resolve(&self, op: OpId, id: Option<OpId>, leftward: bool) -> Result<Option<OpId>, IntegrityError> {
        let mut current = id;
        let mut hops = 0;
        while let Some(id) = current {
            if self.find(&id).is_some() {
                return Ok(Some(id));
            }
            let forward = self
                .forward(&id)
                .ok_or(IntegrityError::UnknownReference { op, missing: id })?;
            current = if leftward { forward.left } else { forward.right };
            hops += 1;
            if hops > self.forwards.len() {
                return Err(IntegrityError::UnknownReference { op, missing: id });
            }
        }
        Ok(None)
    }

    fn integrate(&mut self, op: &Operation) -> Result<Vec<TextChange>, IntegrityError> {
        match &op.kind {
            OpKind::Insert {
                origin_left,
                origin_right,
                content,
            } => Ok(vec![self.integrate_insert(op, *origin_left, *origin_right, content)?]),
            OpKind::Delete { targets } => {
                if let Some(missing) = targets
                    .iter()
                    .flat_map(|t| [t.start, t.last()])
                    .find(|id| !self.is_known(id))
                {
                    return Err(IntegrityError::UnknownReference { op: op.id, missing });
                }
                Ok(self.integrate_delete(op))
            }
        }
    }

    fn integrate_insert(
        &mut self,
        op: &Operation,
        origin_left: Option<OpId>,
        origin_right: Option<OpId>,
        content: &str,
    ) -> Result<TextChange, IntegrityError> {
        let left_id = self.resolve(op.id, origin_left, true)?;
        let right_id = self.resolve(op.id, origin_right, false)?;
        if let Some(id) = &left_id {
            self.split_after(id);
        }
        if let Some(id) = &right_id {
            self.split_before(id);
        }
        let left = left_id.and_then(|id| self.find(&id)).map(|(index, _)| index);
        let right = right_id
            .and_then(|id| self.find(&id))
            .map_or(self.items.len(), |(index, _)| index);

        let item = Item {
            id: op.id,
            origin_left,
            origin_right,
            content: content.chars().collect(),
            deleted_by: None,
        };
        let index = self.place(&item, left, right);
        let offset = self.visible_before(index);

        self.visible += item.len();
        self.items.insert(index, item);
        if index > 0 && self.items[index - 1].continues(&self.items[index]) {
            let tail = self.items.remove(index);
            self.items[index - 1].content.extend(tail.content);
        }

        self.version.observe(op.id.author, op.last().seq);
        Ok(TextChange::insertion(offset, content))
    }

    /// One pass over the runs, splitting them at target boundaries
    fn integrate_delete(&mut self, op: &Operation) -> Vec<TextChange> {
        let mut changes: Vec<TextChange> = Vec::new();
        let OpKind::Delete { targets } = &op.kind else {
            return changes;
        };

        // Disjoint, sorted inclusive spans per author
        let mut spans: HashMap<Uuid, Vec<(u64, u64)>> = HashMap::new();
        for target in targets {
            spans
                .entry(target.start.author)
                .or_default()
                .push((target.start.seq, target.last().seq));
        }
        for list in spans.values_mut() {
            list.sort_unstable();
            let mut merged: Vec<(u64, u64)> = Vec::with_capacity(list.len());
            for (first, last) in list.drain(..) {
                match merged.last_mut() {
                    Some(prev) if first <= prev.1.saturating_add(1) => prev.1 = prev.1.max(last),
                    _ => merged.push((first, last)),
                }
            }
            *list = merged;
        }

        let mut index = 0;
        let mut offset = 0;
        while index < self.items.len() {
            let item = &self.items[index];
            let overlap = item
                .is_visible()
                .then(|| spans.get(&item.id.author))
                .flatten()
                .and_then(|list| {
                    let first = item.id.seq;
                    let last = item.last().seq;
                    let at = list.partition_point(|(_, end)| *end < first);
                    list.get(at)
                        .filter(|(start, _)| *start <= last)
                        .map(|(start, end)| {
                            let from = (*start).max(first) - first;
                            let to = (*end).min(last) - first + 1;
                            (from as usize, to as usize)
                        })
                });

            let Some((from, to)) = overlap else {
                offset += item.visible_len();
                index += 1;
                continue;
            };
            if from > 0 {
                let tail = self.items[index].split_off(from);
                self.items.insert(index + 1, tail);
                offset += from;
                index += 1;
                continue;
            }
            if to < self.items[index].len() {
                let tail = self.items[index].split_off(to);
                self.items.insert(index + 1, tail);
            }

            self.items[index].deleted_by = Some(op.id);
            self.visible -= to;
            match changes.last_mut() {
                Some(last) if last.span.start == offset => last.span.end += to,
                _ => changes.push(TextChange::deletion(offset..offset + to)),
            }
            index += 1;
        }

        self.version.observe(op.id.author, op.id.seq);
        changes
    }

    /// Index at which `item` goes among the concurrent runs between the
    /// run ending at `left` and the one starting at `right`
    fn place(&self, item: &Item, left: Option<usize>, right: usize) -> usize {
        let mut left = left;
        let mut cursor = left.map_or(0, |l| l + 1);
        let mut before_origin: Vec<IdRange> = Vec::new();
        let mut conflicting: Vec<IdRange> = Vec::new();

        while cursor < right {
            let other = &self.items[cursor];
            before_origin.push(other.range());
            conflicting.push(other.range());

            if other.origin_left == item.origin_left {
                if other.id < item.id {
                    left = Some(cursor);
                    conflicting.clear();
                } else if other.origin_right == item.origin_right {
                    break;
                }
            } else if let Some(anchor) = other
                .origin_left
                .filter(|o| before_origin.iter().any(|r| r.contains(o)))
            {
                if !conflicting.iter().any(|r| r.contains(&anchor)) {
                    left = Some(cursor);
                    conflicting.clear();
                }
            } else {
                break;
            }
            cursor += 1;
        }

        left.map_or(0, |l| l + 1)
    }
}
