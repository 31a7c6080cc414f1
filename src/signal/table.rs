//! Explicit name → binding declaration table.

use super::SignalBinding;
use crate::error::{DeviceError, DeviceResult};
use std::sync::Arc;

/// Ordered table of named signal bindings, built once at construction.
#[derive(Clone, Default)]
pub struct SignalTable {
    entries: Vec<(String, Arc<dyn SignalBinding>)>,
}

impl std::fmt::Debug for SignalTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(name, binding)| (name, &binding.reference().address)),
            )
            .finish()
    }
}

impl SignalTable {
    /// Create an empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a signal. Names are unique within one table.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        binding: Arc<dyn SignalBinding>,
    ) -> DeviceResult<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(DeviceError::DuplicateName(name));
        }
        self.entries.push((name, binding));
        Ok(())
    }

    /// Builder-style [`SignalTable::insert`].
    pub fn with(
        mut self,
        name: impl Into<String>,
        binding: Arc<dyn SignalBinding>,
    ) -> DeviceResult<Self> {
        self.insert(name, binding)?;
        Ok(self)
    }

    /// Binding declared under `name`.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn SignalBinding>> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, binding)| binding)
    }

    /// Whether the entry is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Declared names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Name and binding pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn SignalBinding>)> {
        self.entries.iter().map(|(name, binding)| (name.as_str(), binding))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{MemorySignal, SignalKind, SignalRef, SignalValue};

    fn binding(address: &str) -> Arc<dyn SignalBinding> {
        Arc::new(MemorySignal::new(
            SignalRef::read_only(address, SignalKind::Numeric),
            SignalValue::Numeric(0.0),
        ))
    }

    #[test]
    fn test_insert_preserves_order_and_rejects_duplicates() {
        let mut table = SignalTable::new();
        table.insert("readback", binding("M:RBV")).unwrap();
        table.insert("done", binding("M:DMOV")).unwrap();

        let err = table.insert("readback", binding("M:OTHER")).unwrap_err();
        assert_eq!(err, DeviceError::DuplicateName("readback".into()));

        assert_eq!(table.names().collect::<Vec<_>>(), vec!["readback", "done"]);
        assert_eq!(table.get("done").unwrap().reference().address, "M:DMOV");
        assert!(table.get("missing").is_none());
    }
}
