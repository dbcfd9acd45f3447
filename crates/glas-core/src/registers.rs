//! Registers: shared mutable cells with optimistic versioning.
//!
//! A register holds one value (initially unit) inside a volume: a
//! fresh named volume, an associative volume anchored on a register
//! pair, or the process-global volume. Cells never lock against each
//! other; every open step journals its accesses and validates
//! per-kind commit stamps during the serialized commit phase. Queue
//! appends and bag operations keep their own stamps so order-
//! insensitive writers do not invalidate one another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rand::Rng;

use crate::errors::GlasError;
use crate::rope;
use crate::value::Value;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-kind commit counters. A committing step validates the kinds its
/// access modes are sensitive to and bumps the kinds it mutates.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
struct Stamps {
    write: u64,
    head: u64,
    tail: u64,
    bag_take: u64,
    bag_add: u64,
}

struct Claim {
    token: u64,
    index: u64,
}

struct CellState {
    value: Value,
    stamps: Stamps,
    /// Open bag-read reservations; no two committed bag reads may
    /// observe the same physical item.
    claims: Vec<Claim>,
    /// Self-reference held while the committed value is non-unit, so
    /// occupied cells stay resident in their (weakly held) volume
    /// directory even when every handle is dropped. A unit-valued cell
    /// is indistinguishable from a never-materialized one and may be
    /// collected.
    anchor: Option<Arc<RegisterCell>>,
}

pub(crate) struct RegisterCell {
    id: u64,
    persistent: bool,
    state: Mutex<CellState>,
    /// Associative volumes anchored on this register, keyed by the
    /// partner register's id.
    assoc: Mutex<HashMap<u64, Volume>>,
}

impl RegisterCell {
    fn new(persistent: bool) -> Arc<RegisterCell> {
        Arc::new(RegisterCell {
            id: fresh_id(),
            persistent,
            state: Mutex::new(CellState {
                value: Value::Leaf,
                stamps: Stamps::default(),
                claims: Vec::new(),
                anchor: None,
            }),
            assoc: Mutex::new(HashMap::new()),
        })
    }
}

/// A handle to one register. Identity is the cell, not the name it was
/// reached through.
#[derive(Clone)]
pub struct RegisterRef {
    pub(crate) cell: Arc<RegisterCell>,
}

impl RegisterRef {
    pub fn id(&self) -> u64 {
        self.cell.id
    }

    /// A key for sealing. The sealed data co-owns the key register, so
    /// the key stays resolvable for as long as anything sealed under it
    /// exists.
    pub fn seal_ref(&self) -> SealRef {
        SealRef {
            id: self.cell.id,
            cell: self.cell.clone(),
        }
    }

    /// The committed value right now, outside any step. Used by
    /// diagnostics only.
    pub fn peek_committed(&self) -> Value {
        self.cell.state.lock().unwrap().value.clone()
    }
}

impl PartialEq for RegisterRef {
    fn eq(&self, other: &Self) -> bool {
        self.cell.id == other.cell.id
    }
}

impl Eq for RegisterRef {}

impl std::fmt::Debug for RegisterRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegisterRef({})", self.cell.id)
    }
}

/// Seal key: the identity of (and a keep-alive reference to) the key
/// register.
#[derive(Clone)]
pub struct SealRef {
    id: u64,
    #[allow(dead_code)]
    cell: Arc<RegisterCell>,
}

impl SealRef {
    pub fn id(&self) -> u64 {
        self.id
    }
}

enum VolumeKind {
    Fresh,
    Global,
    Assoc,
}

pub(crate) struct VolumeInner {
    kind: VolumeKind,
    persistent: bool,
    /// Weak directory entries: a register lives only while a handle, a
    /// journal, a seal, or its own committed content anchors it. Dead
    /// entries are swept on materialization.
    cells: Mutex<HashMap<String, Weak<RegisterCell>>>,
    /// Associative volumes pin their defining registers so the pair
    /// identity cannot be collected and re-derived differently.
    _pair_anchor: Option<(Arc<RegisterCell>, Arc<RegisterCell>)>,
}

/// A logically infinite namespace of registers, materialized lazily.
#[derive(Clone)]
pub struct Volume {
    inner: Arc<VolumeInner>,
}

impl Volume {
    pub fn fresh() -> Volume {
        Volume {
            inner: Arc::new(VolumeInner {
                kind: VolumeKind::Fresh,
                persistent: false,
                cells: Mutex::new(HashMap::new()),
                _pair_anchor: None,
            }),
        }
    }

    /// Scaffolding for externally backed volumes: same semantics as a
    /// fresh volume, but rejects ephemeral data at write time.
    pub fn fresh_persistent() -> Volume {
        Volume {
            inner: Arc::new(VolumeInner {
                kind: VolumeKind::Fresh,
                persistent: true,
                cells: Mutex::new(HashMap::new()),
                _pair_anchor: None,
            }),
        }
    }

    /// The process-wide static volume. It outlives every transaction,
    /// so it rejects ephemeral data the way any persistent register
    /// does.
    pub fn global() -> Volume {
        static GLOBAL: once_cell::sync::Lazy<Volume> = once_cell::sync::Lazy::new(|| Volume {
            inner: Arc::new(VolumeInner {
                kind: VolumeKind::Global,
                persistent: true,
                cells: Mutex::new(HashMap::new()),
                _pair_anchor: None,
            }),
        });
        GLOBAL.clone()
    }

    /// The associative volume for an ordered register pair. Anchored
    /// on the left register and pinning both ends, so the same pair
    /// always yields the same volume.
    pub fn assoc(lhs: &RegisterRef, rhs: &RegisterRef) -> Volume {
        let mut table = lhs.cell.assoc.lock().unwrap();
        table
            .entry(rhs.id())
            .or_insert_with(|| Volume {
                inner: Arc::new(VolumeInner {
                    kind: VolumeKind::Assoc,
                    persistent: false,
                    cells: Mutex::new(HashMap::new()),
                    _pair_anchor: Some((lhs.cell.clone(), rhs.cell.clone())),
                }),
            })
            .clone()
    }

    /// Materialize (or find) the register with the given resolved name.
    pub fn cell(&self, name: &str) -> RegisterRef {
        let mut cells = self.inner.cells.lock().unwrap();
        if let Some(cell) = cells.get(name).and_then(|w| w.upgrade()) {
            return RegisterRef { cell };
        }
        cells.retain(|_, w| w.strong_count() > 0);
        let cell = RegisterCell::new(self.inner.persistent);
        cells.insert(name.to_string(), Arc::downgrade(&cell));
        RegisterRef { cell }
    }

    /// Diagnostic: live directory entries, after sweeping the dead.
    pub fn resident_cells(&self) -> usize {
        let mut cells = self.inner.cells.lock().unwrap();
        cells.retain(|_, w| w.strong_count() > 0);
        cells.len()
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner.kind {
            VolumeKind::Fresh => "fresh",
            VolumeKind::Global => "global",
            VolumeKind::Assoc => "assoc",
        };
        write!(f, "Volume({})", kind)
    }
}

// --- step journal ------------------------------------------------------

#[derive(Clone, Copy, Default, PartialEq, Eq)]
struct Modes(u8);

impl Modes {
    const READ: Modes = Modes(1);
    const WRITE: Modes = Modes(2);
    const QREAD: Modes = Modes(4);
    const QWRITE: Modes = Modes(8);
    const BAGREAD: Modes = Modes(16);
    const BAGWRITE: Modes = Modes(32);

    fn insert(&mut self, other: Modes) {
        self.0 |= other.0;
    }

    fn contains(self, other: Modes) -> bool {
        self.0 & other.0 != 0
    }
}

#[derive(Clone)]
struct Access {
    reg: RegisterRef,
    base: Stamps,
    modes: Modes,
    /// Final overwrite from set/swap; absorbs earlier deltas.
    write: Option<Value>,
    /// Items pushed back onto the head, in queue order.
    q_unread: Vec<Value>,
    /// Count of items consumed from the committed head.
    q_consumed: u64,
    q_append: Vec<Value>,
    /// Bag reservations made by this step: token, committed index,
    /// and the observed copy.
    bag_claims: Vec<(u64, u64, Value)>,
    bag_append: Vec<Value>,
}

impl Access {
    fn validated(&self, cur: &Stamps) -> bool {
        let b = &self.base;
        if self.modes.contains(Modes::WRITE)
            && (cur.write, cur.head, cur.tail, cur.bag_take, cur.bag_add)
                != (b.write, b.head, b.tail, b.bag_take, b.bag_add)
        {
            return false;
        }
        if self.modes.contains(Modes::READ)
            && (cur.write, cur.head, cur.bag_take) != (b.write, b.head, b.bag_take)
        {
            return false;
        }
        if self.modes.contains(Modes::QREAD) && (cur.write, cur.head) != (b.write, b.head) {
            return false;
        }
        if self
            .modes
            .contains(Modes::QWRITE | Modes::BAGREAD | Modes::BAGWRITE)
            && cur.write != b.write
        {
            return false;
        }
        true
    }
}

impl std::ops::BitOr for Modes {
    type Output = Modes;
    fn bitor(self, rhs: Modes) -> Modes {
        Modes(self.0 | rhs.0)
    }
}

/// The register side of one open step: recorded accesses, buffered
/// effects, and bag reservations. Cloneable so checkpoints can snapshot
/// and restore it.
#[derive(Clone, Default)]
pub(crate) struct StepJournal {
    entries: HashMap<u64, Access>,
}

impl StepJournal {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&mut self, reg: &RegisterRef, modes: Modes) -> &mut Access {
        let access = self.entries.entry(reg.id()).or_insert_with(|| Access {
            reg: reg.clone(),
            base: reg.cell.state.lock().unwrap().stamps,
            modes: Modes::default(),
            write: None,
            q_unread: Vec::new(),
            q_consumed: 0,
            q_append: Vec::new(),
            bag_claims: Vec::new(),
            bag_append: Vec::new(),
        });
        access.modes.insert(modes);
        access
    }

    /// The value this step observes for the register: the committed
    /// value with this step's own effects applied. Claim positions are
    /// taken from the cell, which stays current as other commits
    /// reshape the committed list.
    fn effective(access: &Access) -> Value {
        if let Some(w) = &access.write {
            return w.clone();
        }
        let (committed, mut claimed) = {
            let st = access.reg.cell.state.lock().unwrap();
            let claimed: Vec<u64> = access
                .bag_claims
                .iter()
                .filter_map(|(tok, _, _)| {
                    st.claims.iter().find(|c| c.token == *tok).map(|c| c.index)
                })
                .collect();
            (st.value.clone(), claimed)
        };
        let mut v = committed;
        claimed.sort_unstable();
        for idx in claimed.into_iter().rev() {
            v = remove_index(&v, idx);
        }
        v = rope::drop(&v, access.q_consumed);
        if !access.q_unread.is_empty() {
            v = rope::prepend(access.q_unread.clone(), v);
        }
        if !access.q_append.is_empty() {
            v = rope::concat(v, rope::from_values(access.q_append.clone()));
        }
        if !access.bag_append.is_empty() {
            v = rope::concat(v, rope::from_values(access.bag_append.clone()));
        }
        v
    }

    pub fn read(&mut self, reg: &RegisterRef) -> Result<Value, GlasError> {
        let access = self.entry(reg, Modes::READ);
        let v = Self::effective(access);
        if v.is_linear() {
            return Err(GlasError::linearity("read would copy linear data"));
        }
        Ok(v)
    }

    pub fn write(&mut self, reg: &RegisterRef, v: Value) -> Result<(), GlasError> {
        if reg.cell.persistent && v.is_ephemeral() {
            return Err(GlasError::ephemerality(
                "ephemeral data stored into a persistent register",
            ));
        }
        let access = self.entry(reg, Modes::WRITE);
        access.write = Some(v);
        access.q_unread.clear();
        access.q_consumed = 0;
        access.q_append.clear();
        access.bag_append.clear();
        Ok(())
    }

    /// Atomic read-and-replace. Unlike `read`, moving linear data out
    /// is fine because no copy remains behind.
    pub fn swap(&mut self, reg: &RegisterRef, v: Value) -> Result<Value, GlasError> {
        if reg.cell.persistent && v.is_ephemeral() {
            return Err(GlasError::ephemerality(
                "ephemeral data stored into a persistent register",
            ));
        }
        let access = self.entry(reg, Modes::READ | Modes::WRITE);
        let old = Self::effective(access);
        access.write = Some(v);
        access.q_unread.clear();
        access.q_consumed = 0;
        access.q_append.clear();
        access.bag_append.clear();
        Ok(old)
    }

    /// Remove `n` items from the queue head. Fails without effect when
    /// fewer are available.
    pub fn queue_read(&mut self, reg: &RegisterRef, n: u64) -> Result<Vec<Value>, GlasError> {
        let access = self.entry(reg, Modes::QREAD);
        let (committed_len, committed) = match &access.write {
            Some(w) => (rope::len(w).unwrap_or(0), w.clone()),
            None => {
                let v = reg.cell.state.lock().unwrap().value.clone();
                (rope::len(&v).unwrap_or(0), v)
            }
        };
        let rest = committed_len.saturating_sub(access.q_consumed);
        let avail = access.q_unread.len() as u64 + rest + access.q_append.len() as u64;
        if avail < n {
            return Err(GlasError::data_qty(format!(
                "queue holds {} of {} requested items",
                avail, n
            )));
        }
        let mut out = Vec::with_capacity(n as usize);
        let mut need = n;
        while need > 0 && !access.q_unread.is_empty() {
            out.push(access.q_unread.remove(0));
            need -= 1;
        }
        if need > 0 && rest > 0 {
            let k = need.min(rest);
            let skip = access.q_consumed;
            for i in 0..k {
                let item = rope::index(&committed, skip + i)
                    .ok_or_else(|| GlasError::data_qty("queue shorter than recorded"))?;
                out.push(item);
            }
            if access.write.is_some() {
                // Local list: consume directly from the override.
                access.write = Some(rope::drop(&committed, skip + k));
            } else {
                access.q_consumed += k;
            }
            need -= k;
        }
        while need > 0 {
            out.push(access.q_append.remove(0));
            need -= 1;
        }
        Ok(out)
    }

    /// Push items back onto the queue head, first item outermost.
    pub fn queue_unread(&mut self, reg: &RegisterRef, items: Vec<Value>) {
        let access = self.entry(reg, Modes::QREAD);
        if let Some(w) = &access.write {
            access.write = Some(rope::prepend(items, w.clone()));
            return;
        }
        let mut front = items;
        front.extend(access.q_unread.drain(..));
        access.q_unread = front;
    }

    /// Append items to the queue tail. Buffered until commit; appends
    /// from concurrent steps do not conflict.
    pub fn queue_write(&mut self, reg: &RegisterRef, items: Vec<Value>) {
        let access = self.entry(reg, Modes::QWRITE);
        if let Some(w) = &access.write {
            access.write = Some(rope::concat(w.clone(), rope::from_values(items)));
            return;
        }
        access.q_append.extend(items);
    }

    /// Remove one non-deterministically chosen item from the bag.
    pub fn bag_read(&mut self, reg: &RegisterRef) -> Result<Value, GlasError> {
        let access = self.entry(reg, Modes::BAGREAD);
        if access.write.is_some() {
            // Operating on the local override: take a random element.
            let w = access.write.clone().expect("override present");
            let len = rope::len(&w).unwrap_or(0);
            if len == 0 {
                return Err(GlasError::data_qty("bag is empty"));
            }
            let idx = rand::thread_rng().gen_range(0..len);
            let item = rope::index(&w, idx).expect("index in range");
            access.write = Some(remove_index(&w, idx));
            return Ok(item);
        }
        // Try to reserve a committed item nobody else holds. Claims of
        // every open step, including this one, live in the cell.
        {
            let mut st = reg.cell.state.lock().unwrap();
            let len = rope::len(&st.value).unwrap_or(0);
            let mut open: Vec<u64> = (0..len)
                .filter(|i| {
                    *i >= access.q_consumed && !st.claims.iter().any(|c| c.index == *i)
                })
                .collect();
            if !open.is_empty() {
                let pick = open.remove(rand::thread_rng().gen_range(0..open.len()));
                let token = fresh_id();
                let item = rope::index(&st.value, pick).expect("claimed index in range");
                st.claims.push(Claim { token, index: pick });
                access.bag_claims.push((token, pick, item.clone()));
                return Ok(item);
            }
        }
        // Fall back to items this step added itself.
        if !access.bag_append.is_empty() {
            let idx = rand::thread_rng().gen_range(0..access.bag_append.len());
            return Ok(access.bag_append.swap_remove(idx));
        }
        if !access.q_append.is_empty() {
            let idx = rand::thread_rng().gen_range(0..access.q_append.len());
            return Ok(access.q_append.remove(idx));
        }
        Err(GlasError::data_qty("bag is empty"))
    }

    /// Add an item to the bag.
    pub fn bag_write(&mut self, reg: &RegisterRef, v: Value) {
        let access = self.entry(reg, Modes::BAGWRITE);
        if let Some(w) = &access.write {
            access.write = Some(rope::concat(w.clone(), rope::from_values(vec![v])));
            return;
        }
        access.bag_append.push(v);
    }

    /// Check every access against current stamps. Call while holding
    /// the runtime commit lock.
    pub fn validate(&self) -> Result<(), GlasError> {
        for access in self.entries.values() {
            let st = access.reg.cell.state.lock().unwrap();
            if !access.validated(&st.stamps) {
                return Err(GlasError::conflict(format!(
                    "register {} changed since first access",
                    access.reg.id()
                )));
            }
        }
        Ok(())
    }

    /// Install every buffered effect and bump the matching stamps.
    /// Call while holding the runtime commit lock, after `validate`.
    pub fn apply(&mut self) {
        for access in self.entries.values() {
            let mut st = access.reg.cell.state.lock().unwrap();
            let mut v = st.value.clone();

            if !access.bag_claims.is_empty() {
                // The cell's claim table carries the current index of
                // each reservation; the journal's recorded position may
                // predate other committed removals.
                let mut mine: Vec<(u64, u64)> = access
                    .bag_claims
                    .iter()
                    .filter_map(|(tok, _, _)| {
                        st.claims
                            .iter()
                            .find(|c| c.token == *tok)
                            .map(|c| (*tok, c.index))
                    })
                    .collect();
                mine.sort_unstable_by_key(|(_, idx)| *idx);
                for (tok, idx) in mine.into_iter().rev() {
                    v = remove_index(&v, idx);
                    st.claims.retain(|c| c.token != tok);
                    for c in st.claims.iter_mut() {
                        if c.index > idx {
                            c.index -= 1;
                        }
                    }
                }
                st.stamps.bag_take += 1;
            }
            if access.q_consumed > 0 {
                v = rope::drop(&v, access.q_consumed);
                for c in st.claims.iter_mut() {
                    c.index = c.index.saturating_sub(access.q_consumed);
                }
                st.stamps.head += 1;
            }
            if !access.q_unread.is_empty() {
                v = rope::prepend(access.q_unread.clone(), v);
                st.stamps.head += 1;
            }
            if !access.q_append.is_empty() {
                v = rope::concat(v, rope::from_values(access.q_append.clone()));
                st.stamps.tail += 1;
            }
            if !access.bag_append.is_empty() {
                v = rope::concat(v, rope::from_values(access.bag_append.clone()));
                st.stamps.bag_add += 1;
            }
            if let Some(w) = &access.write {
                v = w.clone();
                st.stamps.write += 1;
                // Outstanding reservations point into a value that no
                // longer exists; their owners will fail validation.
                st.claims.clear();
            }
            st.value = v;
            // Occupied cells anchor themselves so committed content
            // survives every handle being dropped; emptied cells become
            // collectible again.
            if matches!(st.value, Value::Leaf) {
                st.anchor = None;
            } else if st.anchor.is_none() {
                st.anchor = Some(access.reg.cell.clone());
            }
        }
        self.entries.clear();
    }

    /// Drop every buffered effect and release bag reservations.
    pub fn rollback(&mut self) {
        for access in self.entries.values() {
            if access.bag_claims.is_empty() {
                continue;
            }
            let mut st = access.reg.cell.state.lock().unwrap();
            for (tok, _, _) in &access.bag_claims {
                st.claims.retain(|c| c.token != *tok);
            }
        }
        self.entries.clear();
    }

    /// Release reservations taken after `snapshot`, used when a
    /// checkpoint restore rewinds the journal.
    pub fn release_claims_since(&self, snapshot: &StepJournal) {
        for access in self.entries.values() {
            let kept: Vec<u64> = snapshot
                .entries
                .get(&access.reg.id())
                .map(|a| a.bag_claims.iter().map(|(tok, _, _)| *tok).collect())
                .unwrap_or_default();
            let dropped: Vec<u64> = access
                .bag_claims
                .iter()
                .map(|(tok, _, _)| *tok)
                .filter(|tok| !kept.contains(tok))
                .collect();
            if dropped.is_empty() {
                continue;
            }
            let mut st = access.reg.cell.state.lock().unwrap();
            st.claims.retain(|c| !dropped.contains(&c.token));
        }
    }

    /// Re-reserve every bag claim under new tokens, for cloned steps
    /// that must be cancellable independently of the original.
    pub fn adopt_claims(&mut self) {
        for access in self.entries.values_mut() {
            if access.bag_claims.is_empty() {
                continue;
            }
            let mut st = access.reg.cell.state.lock().unwrap();
            for (tok, idx, _) in access.bag_claims.iter_mut() {
                let current = st
                    .claims
                    .iter()
                    .find(|c| c.token == *tok)
                    .map(|c| c.index)
                    .unwrap_or(*idx);
                let fresh = fresh_id();
                st.claims.push(Claim {
                    token: fresh,
                    index: current,
                });
                *tok = fresh;
                *idx = current;
            }
        }
    }
}

fn remove_index(v: &Value, idx: u64) -> Value {
    rope::concat(rope::take(v, idx), rope::drop(v, idx + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refct::Refct;
    use crate::value::int_value;

    #[test]
    fn cells_materialize_lazily_and_keep_identity() {
        let vol = Volume::fresh();
        let a = vol.cell("x");
        let b = vol.cell("x");
        assert_eq!(a, b);
        assert_ne!(a, vol.cell("y"));
        assert_eq!(a.peek_committed(), Value::Leaf);
    }

    #[test]
    fn idle_unit_cells_evict_from_fresh_volumes() {
        let vol = Volume::fresh();
        {
            let reg = vol.cell("ghost");
            let mut j = StepJournal::default();
            assert_eq!(j.read(&reg).unwrap(), Value::Leaf);
            j.rollback();
        }
        // Every handle is gone and nothing was committed: the
        // directory entry goes with them.
        assert_eq!(vol.resident_cells(), 0);
        let held = vol.cell("kept");
        assert_eq!(vol.resident_cells(), 1);
        drop(held);
        assert_eq!(vol.resident_cells(), 0);
    }

    #[test]
    fn committed_state_anchors_cells() {
        let vol = Volume::fresh();
        {
            let reg = vol.cell("slot");
            let mut j = StepJournal::default();
            j.write(&reg, int_value(7)).unwrap();
            j.validate().unwrap();
            j.apply();
        }
        // No handles remain, but the committed content keeps the cell
        // resident and readable.
        assert_eq!(vol.resident_cells(), 1);
        let reg = vol.cell("slot");
        let mut j = StepJournal::default();
        assert_eq!(j.read(&reg).unwrap(), int_value(7));
        // Writing unit back releases the anchor.
        j.write(&reg, Value::Leaf).unwrap();
        j.validate().unwrap();
        j.apply();
        drop(reg);
        assert_eq!(vol.resident_cells(), 0);
    }

    #[test]
    fn global_volume_rejects_ephemeral_data() {
        let vol = Volume::global();
        let reg = vol.cell("ephemerality-guard-slot");
        let mut j = StepJournal::default();
        let foreign = Value::foreign(Refct::unmanaged(std::ptr::null_mut()));
        assert!(matches!(
            j.write(&reg, foreign),
            Err(GlasError::Ephemerality(_))
        ));
        assert!(j.write(&reg, int_value(1)).is_ok());
        j.rollback();
    }

    #[test]
    fn assoc_volume_is_stable_per_pair() {
        let vol = Volume::fresh();
        let l = vol.cell("l");
        let r = vol.cell("r");
        let v1 = Volume::assoc(&l, &r);
        let v2 = Volume::assoc(&l, &r);
        let c1 = v1.cell("k");
        let c2 = v2.cell("k");
        assert_eq!(c1, c2);
        // Ordered pair: reversing the ends is a different volume.
        let v3 = Volume::assoc(&r, &l);
        assert_ne!(v3.cell("k"), c1);
    }

    #[test]
    fn read_write_through_journal() {
        let vol = Volume::fresh();
        let reg = vol.cell("n");
        let mut j = StepJournal::default();
        assert_eq!(j.read(&reg).unwrap(), Value::Leaf);
        j.write(&reg, int_value(7)).unwrap();
        assert_eq!(j.read(&reg).unwrap(), int_value(7));
        // Not yet visible to other journals.
        let mut other = StepJournal::default();
        assert_eq!(other.read(&reg).unwrap(), Value::Leaf);
        j.validate().unwrap();
        j.apply();
        let mut after = StepJournal::default();
        assert_eq!(after.read(&reg).unwrap(), int_value(7));
    }

    #[test]
    fn write_write_conflict_second_loses() {
        let vol = Volume::fresh();
        let reg = vol.cell("n");
        let mut a = StepJournal::default();
        let mut b = StepJournal::default();
        a.write(&reg, int_value(1)).unwrap();
        b.write(&reg, int_value(2)).unwrap();
        a.validate().unwrap();
        a.apply();
        assert!(b.validate().is_err());
        b.rollback();
        let mut after = StepJournal::default();
        assert_eq!(after.read(&reg).unwrap(), int_value(1));
    }

    #[test]
    fn queue_appends_do_not_conflict() {
        let vol = Volume::fresh();
        let reg = vol.cell("q");
        let mut a = StepJournal::default();
        let mut b = StepJournal::default();
        a.queue_write(&reg, vec![int_value(1)]);
        b.queue_write(&reg, vec![int_value(2)]);
        a.validate().unwrap();
        a.apply();
        b.validate().unwrap();
        b.apply();
        let mut c = StepJournal::default();
        let items = c.queue_read(&reg, 2).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.contains(&int_value(1)) && items.contains(&int_value(2)));
    }

    #[test]
    fn queue_read_fails_without_enough_items() {
        let vol = Volume::fresh();
        let reg = vol.cell("q");
        let mut j = StepJournal::default();
        j.queue_write(&reg, vec![int_value(1)]);
        // Own append is visible within the step.
        assert_eq!(j.queue_read(&reg, 1).unwrap(), vec![int_value(1)]);
        assert!(j.queue_read(&reg, 1).is_err());
    }

    #[test]
    fn queue_unread_restores_head() {
        let vol = Volume::fresh();
        let reg = vol.cell("q");
        let mut setup = StepJournal::default();
        setup.queue_write(&reg, vec![int_value(1), int_value(2)]);
        setup.validate().unwrap();
        setup.apply();
        let mut j = StepJournal::default();
        let got = j.queue_read(&reg, 1).unwrap();
        assert_eq!(got, vec![int_value(1)]);
        j.queue_unread(&reg, got);
        assert_eq!(
            j.queue_read(&reg, 2).unwrap(),
            vec![int_value(1), int_value(2)]
        );
    }

    #[test]
    fn bag_readers_observe_distinct_items() {
        let vol = Volume::fresh();
        let reg = vol.cell("b");
        let mut setup = StepJournal::default();
        setup.bag_write(&reg, int_value(10));
        setup.bag_write(&reg, int_value(20));
        setup.validate().unwrap();
        setup.apply();
        let mut a = StepJournal::default();
        let mut b = StepJournal::default();
        let x = a.bag_read(&reg).unwrap();
        let y = b.bag_read(&reg).unwrap();
        assert_ne!(x, y);
        a.validate().unwrap();
        a.apply();
        b.validate().unwrap();
        b.apply();
        let mut after = StepJournal::default();
        assert!(after.bag_read(&reg).is_err());
    }

    #[test]
    fn rollback_releases_reservations() {
        let vol = Volume::fresh();
        let reg = vol.cell("b");
        let mut setup = StepJournal::default();
        setup.bag_write(&reg, int_value(1));
        setup.validate().unwrap();
        setup.apply();
        let mut a = StepJournal::default();
        let _ = a.bag_read(&reg).unwrap();
        a.rollback();
        let mut b = StepJournal::default();
        assert!(b.bag_read(&reg).is_ok());
    }

    #[test]
    fn swap_moves_linear_data_but_read_copies() {
        let vol = Volume::fresh();
        let key = vol.cell("key");
        let reg = vol.cell("slot");
        let sealed = Value::seal(key.seal_ref(), int_value(5), true);
        let mut j = StepJournal::default();
        j.write(&reg, sealed).unwrap();
        assert!(j.read(&reg).is_err());
        let moved = j.swap(&reg, Value::Leaf).unwrap();
        assert!(moved.is_linear());
    }

    #[test]
    fn persistent_volume_rejects_ephemeral_data() {
        let vol = Volume::fresh_persistent();
        let plain = Volume::fresh();
        let key = plain.cell("key");
        let reg = vol.cell("slot");
        let sealed = Value::seal(key.seal_ref(), int_value(5), false);
        let mut j = StepJournal::default();
        assert!(j.write(&reg, sealed).is_err());
        assert!(j.write(&reg, int_value(5)).is_ok());
    }
}
