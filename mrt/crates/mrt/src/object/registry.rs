//! Class Registry - Ownership of loaded class metadata
//!
//! The registry entry is what keeps a class alive. Object shadows and
//! descriptor back references are non-owning addresses into these records.

use crate::error::{MrtError, Result};
use crate::object::metadata::{ClassBuilder, ClassMetadata, FieldKind};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Name of the root object class
pub const OBJECT_CLASS: &str = "java/lang/Object";

/// Primitive element kinds that get a canonical array class
const PRIMITIVE_ARRAYS: [FieldKind; 8] = [
    FieldKind::Boolean,
    FieldKind::Byte,
    FieldKind::Short,
    FieldKind::Char,
    FieldKind::Int,
    FieldKind::Long,
    FieldKind::Float,
    FieldKind::Double,
];

/// Registry of loaded classes in load order
pub struct ClassRegistry {
    classes: RwLock<IndexMap<Box<str>, Arc<ClassMetadata>>>,
}

impl ClassRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            classes: RwLock::new(IndexMap::new()),
        }
    }

    /// Create a registry holding the root object class and canonical arrays
    pub fn with_bootstrap_classes() -> Result<Self> {
        let registry = Self::new();
        let object = registry.register(ClassBuilder::new(OBJECT_CLASS))?;
        registry.register(ClassBuilder::object_array(&object))?;
        for kind in PRIMITIVE_ARRAYS {
            registry.register(ClassBuilder::primitive_array(kind))?;
        }
        Ok(registry)
    }

    /// Build and register a class
    ///
    /// The class index is its load position. Registering a name twice is
    /// rejected.
    pub fn register(&self, builder: ClassBuilder) -> Result<Arc<ClassMetadata>> {
        let mut classes = self.classes.write();
        let clindex = u16::try_from(classes.len()).map_err(|_| MrtError::ResourceExhausted {
            resource: "class index space".to_string(),
        })?;

        let class = builder.build(clindex);
        if classes.contains_key(class.name()) {
            return Err(MrtError::InvalidArgument(format!(
                "class {} already registered",
                class.name()
            )));
        }

        classes.insert(class.name().into(), Arc::clone(&class));
        log::debug!("registered class {} (index {})", class.name(), clindex);
        Ok(class)
    }

    /// Look up a class by name
    pub fn get(&self, name: &str) -> Option<Arc<ClassMetadata>> {
        self.classes.read().get(name).cloned()
    }

    /// Look up a class by name or report it unknown
    pub fn require(&self, name: &str) -> Result<Arc<ClassMetadata>> {
        self.get(name)
            .ok_or_else(|| MrtError::UnknownClass(name.to_string()))
    }

    /// Look up a class by its shadow address
    pub fn by_address(&self, addr: usize) -> Option<Arc<ClassMetadata>> {
        self.classes
            .read()
            .values()
            .find(|c| c.address() == addr)
            .cloned()
    }

    /// Canonical array class for a primitive element kind
    pub fn primitive_array(&self, elem: FieldKind) -> Option<Arc<ClassMetadata>> {
        self.get(&format!("[{}", elem.descriptor()))
    }

    /// Snapshot of every class in load order
    pub fn all(&self) -> Vec<Arc<ClassMetadata>> {
        self.classes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.read().is_empty()
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_classes() {
        let registry = ClassRegistry::with_bootstrap_classes().unwrap();
        assert_eq!(registry.len(), 10);
        assert!(registry.get(OBJECT_CLASS).is_some());
        assert!(registry.get("[Ljava/lang/Object;").is_some());
        let ints = registry.primitive_array(FieldKind::Int).unwrap();
        assert_eq!(ints.name(), "[I");
    }

    #[test]
    fn test_register_assigns_load_order() {
        let registry = ClassRegistry::new();
        let a = registry.register(ClassBuilder::new("A")).unwrap();
        let b = registry.register(ClassBuilder::new("B")).unwrap();
        assert_eq!(a.clindex(), 0);
        assert_eq!(b.clindex(), 1);

        let names: Vec<String> = registry.all().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = ClassRegistry::new();
        registry.register(ClassBuilder::new("Dup")).unwrap();
        assert!(matches!(
            registry.register(ClassBuilder::new("Dup")),
            Err(MrtError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_lookup_by_address() {
        let registry = ClassRegistry::new();
        let class = registry.register(ClassBuilder::new("Addr")).unwrap();
        let found = registry.by_address(class.address()).unwrap();
        assert!(Arc::ptr_eq(&class, &found));
        assert!(matches!(registry.require("Missing"), Err(MrtError::UnknownClass(_))));
    }
}
