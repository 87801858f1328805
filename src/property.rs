//! Observable properties with granular and bulk change notifications.
//!
//! Every write to a [`Property`] or [`ListProperty`] goes through a
//! [`Notifier`], which queues a [`PropertyChange`] for the owning backend to
//! dispatch. List writes are tagged: [`ListProperty::set_index`] produces a
//! [`ChangeKind::Granular`] change carrying the touched index, while
//! [`ListProperty::replace_all`] produces [`ChangeKind::Bulk`]. Control lists
//! only issue device commands for granular changes, which is what keeps the
//! state-to-control mirror from feeding back into the device.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::error::{BackendError, Result};

// How a property was mutated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    // One or more indices of a list were assigned individually
    Granular(BTreeSet<usize>),
    // The whole value was replaced
    Bulk,
}

impl ChangeKind {
    pub fn indices(&self) -> Option<&BTreeSet<usize>> {
        match self {
            ChangeKind::Granular(indices) => Some(indices),
            ChangeKind::Bulk => None,
        }
    }

    fn merge(self, other: ChangeKind) -> ChangeKind {
        match (self, other) {
            (ChangeKind::Granular(mut a), ChangeKind::Granular(b)) => {
                a.extend(b);
                ChangeKind::Granular(a)
            }
            _ => ChangeKind::Bulk,
        }
    }
}

// Snapshot of a property value carried by a change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Flag(bool),
    Count(usize),
    Text(Option<String>),
    Routing(Vec<usize>),
    Labels(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub name: &'static str,
    pub value: Value,
    pub kind: ChangeKind,
}

impl PropertyChange {
    pub fn is_granular(&self) -> bool {
        matches!(self.kind, ChangeKind::Granular(_))
    }
}

// Scalar types that can live in a `Property`
pub trait Observable: Clone + PartialEq {
    fn to_value(&self) -> Value;
}

impl Observable for bool {
    fn to_value(&self) -> Value {
        Value::Flag(*self)
    }
}

impl Observable for usize {
    fn to_value(&self) -> Value {
        Value::Count(*self)
    }
}

impl Observable for Option<String> {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }
}

// Element types that can live in a `ListProperty`
pub trait ListItem: Clone + PartialEq + Default {
    fn list_value(items: &[Self]) -> Value;
}

impl ListItem for usize {
    fn list_value(items: &[Self]) -> Value {
        Value::Routing(items.to_vec())
    }
}

impl ListItem for String {
    fn list_value(items: &[Self]) -> Value {
        Value::Labels(items.to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct Property<T> {
    name: &'static str,
    value: T,
}

impl<T: Observable> Property<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        Self { name, value }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    // Assign a new value, returning whether anything changed
    pub fn set(&mut self, value: T, notifier: &mut Notifier) -> bool {
        if self.value == value {
            return false;
        }
        self.value = value;
        notifier.emit(PropertyChange {
            name: self.name,
            value: self.value.to_value(),
            kind: ChangeKind::Bulk,
        });
        true
    }
}

#[derive(Debug, Clone)]
pub struct ListProperty<T> {
    name: &'static str,
    items: Vec<T>,
}

impl<T: ListItem> ListProperty<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            items: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }

    /// Granular write of a single index.
    ///
    /// Fails without mutating when `index` is past the end. Returns whether
    /// the stored value changed; an unchanged write emits nothing.
    pub fn set_index(&mut self, index: usize, value: T, notifier: &mut Notifier) -> Result<bool> {
        let len = self.items.len();
        let slot = self
            .items
            .get_mut(index)
            .ok_or(BackendError::IndexOutOfRange {
                property: self.name,
                index,
                len,
            })?;
        if *slot == value {
            return Ok(false);
        }
        *slot = value;
        notifier.emit(PropertyChange {
            name: self.name,
            value: T::list_value(&self.items),
            kind: ChangeKind::Granular(BTreeSet::from([index])),
        });
        Ok(true)
    }

    /// Bulk replacement of the whole list.
    pub fn replace_all(&mut self, items: Vec<T>, notifier: &mut Notifier) -> bool {
        if self.items == items {
            return false;
        }
        self.items = items;
        notifier.emit(PropertyChange {
            name: self.name,
            value: T::list_value(&self.items),
            kind: ChangeKind::Bulk,
        });
        true
    }

    // Replace with `len` default items when the length differs
    pub fn resize_default(&mut self, len: usize, notifier: &mut Notifier) -> bool {
        if self.items.len() == len {
            return false;
        }
        self.replace_all(vec![T::default(); len], notifier)
    }
}

#[derive(Debug, Default)]
struct Held {
    depth: usize,
    change: Option<PropertyChange>,
}

/// Queue of property changes waiting to be dispatched, plus the set of
/// property names whose notifications are currently held.
#[derive(Debug, Default)]
pub struct Notifier {
    pending: VecDeque<PropertyChange>,
    held: HashMap<&'static str, Held>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, change: PropertyChange) {
        match self.held.get_mut(change.name) {
            Some(held) => {
                let PropertyChange { name, value, kind } = change;
                let kind = match held.change.take() {
                    Some(previous) => previous.kind.merge(kind),
                    None => kind,
                };
                held.change = Some(PropertyChange { name, value, kind });
            }
            None => self.pending.push_back(change),
        }
    }

    // Start holding notifications for `name`. Holds nest.
    pub fn hold(&mut self, name: &'static str) {
        self.held.entry(name).or_default().depth += 1;
    }

    /// Drop one level of hold on `name`. Leaving the outermost level queues
    /// the single coalesced change collected meanwhile, if any.
    pub fn release(&mut self, name: &'static str) {
        let Some(held) = self.held.get_mut(name) else {
            log::warn!("release of {} without a matching hold", name);
            return;
        };
        held.depth = held.depth.saturating_sub(1);
        if held.depth > 0 {
            return;
        }
        if let Some(change) = self.held.remove(name).and_then(|held| held.change) {
            self.pending.push_back(change);
        }
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.contains_key(name)
    }

    pub fn next(&mut self) -> Option<PropertyChange> {
        self.pending.pop_front()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(notifier: &mut Notifier) -> Vec<PropertyChange> {
        std::iter::from_fn(|| notifier.next()).collect()
    }

    #[test]
    fn scalar_set_emits_only_on_change() {
        let mut notifier = Notifier::new();
        let mut connected = Property::new("connected", false);

        assert!(!connected.set(false, &mut notifier));
        assert!(!notifier.has_pending());

        assert!(connected.set(true, &mut notifier));
        let changes = drain(&mut notifier);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].name, "connected");
        assert_eq!(changes[0].value, Value::Flag(true));
        assert_eq!(changes[0].kind, ChangeKind::Bulk);
    }

    #[test]
    fn set_index_is_granular_and_replace_all_is_bulk() {
        let mut notifier = Notifier::new();
        let mut routing: ListProperty<usize> = ListProperty::new("crosspoints");
        routing.replace_all(vec![0, 0, 0], &mut notifier);
        routing.set_index(1, 4, &mut notifier).unwrap();

        let changes = drain(&mut notifier);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].kind, ChangeKind::Bulk);
        assert!(!changes[0].is_granular());
        assert_eq!(changes[1].kind.indices(), Some(&BTreeSet::from([1])));
        assert_eq!(changes[1].value, Value::Routing(vec![0, 4, 0]));
    }

    #[test]
    fn unchanged_writes_are_silent() {
        let mut notifier = Notifier::new();
        let mut labels: ListProperty<String> = ListProperty::new("output_labels");
        labels.replace_all(vec!["A".into(), "B".into()], &mut notifier);
        drain(&mut notifier);

        assert!(!labels.set_index(0, "A".into(), &mut notifier).unwrap());
        assert!(!labels.replace_all(vec!["A".into(), "B".into()], &mut notifier));
        assert!(!labels.resize_default(2, &mut notifier));
        assert!(!notifier.has_pending());
    }

    #[test]
    fn set_index_out_of_range_leaves_list_untouched() {
        let mut notifier = Notifier::new();
        let mut routing: ListProperty<usize> = ListProperty::new("crosspoints");
        routing.replace_all(vec![1, 2], &mut notifier);
        drain(&mut notifier);

        let err = routing.set_index(2, 9, &mut notifier).unwrap_err();
        assert!(matches!(
            err,
            BackendError::IndexOutOfRange {
                property: "crosspoints",
                index: 2,
                len: 2
            }
        ));
        assert_eq!(routing.as_slice(), &[1, 2]);
        assert!(!notifier.has_pending());
    }

    #[test]
    fn resize_default_refills_every_slot() {
        let mut notifier = Notifier::new();
        let mut routing: ListProperty<usize> = ListProperty::new("crosspoints");
        routing.replace_all(vec![3, 4], &mut notifier);
        assert!(routing.resize_default(4, &mut notifier));
        assert_eq!(routing.as_slice(), &[0, 0, 0, 0]);
    }

    #[test]
    fn held_changes_coalesce_into_one() {
        let mut notifier = Notifier::new();
        let mut routing: ListProperty<usize> = ListProperty::new("crosspoints");
        routing.replace_all(vec![0; 4], &mut notifier);
        drain(&mut notifier);

        notifier.hold("crosspoints");
        routing.set_index(0, 3, &mut notifier).unwrap();
        routing.set_index(2, 1, &mut notifier).unwrap();
        assert!(!notifier.has_pending());
        assert!(notifier.is_held("crosspoints"));

        notifier.release("crosspoints");
        let changes = drain(&mut notifier);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].value, Value::Routing(vec![3, 0, 1, 0]));
        assert_eq!(changes[0].kind.indices(), Some(&BTreeSet::from([0, 2])));
        assert!(!notifier.is_held("crosspoints"));
    }

    #[test]
    fn nested_holds_release_on_outermost_exit() {
        let mut notifier = Notifier::new();
        let mut routing: ListProperty<usize> = ListProperty::new("crosspoints");

        notifier.hold("crosspoints");
        notifier.hold("crosspoints");
        routing.replace_all(vec![1], &mut notifier);
        routing.set_index(0, 2, &mut notifier).unwrap();

        notifier.release("crosspoints");
        assert!(!notifier.has_pending());
        notifier.release("crosspoints");

        let changes = drain(&mut notifier);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Bulk);
        assert_eq!(changes[0].value, Value::Routing(vec![2]));
    }

    #[test]
    fn hold_without_changes_emits_nothing() {
        let mut notifier = Notifier::new();
        notifier.hold("output_labels");
        notifier.release("output_labels");
        assert!(!notifier.has_pending());
    }

    #[test]
    fn holds_only_affect_their_own_name() {
        let mut notifier = Notifier::new();
        let mut routing: ListProperty<usize> = ListProperty::new("crosspoints");
        let mut inputs = Property::new("num_inputs", 0usize);

        notifier.hold("crosspoints");
        routing.replace_all(vec![1], &mut notifier);
        inputs.set(12, &mut notifier);

        let changes = drain(&mut notifier);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].name, "num_inputs");
    }
}
