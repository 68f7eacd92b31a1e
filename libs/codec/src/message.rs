//! Dynamically typed, copy-on-write messages
//!
//! A `Message` is an ordered sequence of type-erased elements behind an
//! `Arc`. Cloning shares the elements; every mutating accessor detaches first
//! (`Arc::make_mut`), so a message observed by several actors is never
//! changed underneath them.

use lattice_types::Atom;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

/// A value that can be carried inside a `Message`
///
/// Implemented for every `Clone + PartialEq + Debug + Send + Sync + 'static`
/// type. Sending a value to another node additionally requires its type to be
/// registered in the `TypeRegistry`.
pub trait Element: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clone_element(&self) -> Box<dyn Element>;
    fn eq_element(&self, other: &dyn Element) -> bool;
    /// Rust type name, for diagnostics only
    fn rust_type_name(&self) -> &'static str;
}

impl<T> Element for T
where
    T: Any + Clone + PartialEq + fmt::Debug + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_element(&self) -> Box<dyn Element> {
        Box::new(self.clone())
    }

    fn eq_element(&self, other: &dyn Element) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| self == other)
    }

    fn rust_type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

impl Clone for Box<dyn Element> {
    fn clone(&self) -> Self {
        (**self).clone_element()
    }
}

/// Immutable, reference-counted, copy-on-write tuple of elements
#[derive(Clone, Default)]
pub struct Message {
    elements: Arc<Vec<Box<dyn Element>>>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_elements(elements: Vec<Box<dyn Element>>) -> Self {
        Self {
            elements: Arc::new(elements),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn element(&self, index: usize) -> Option<&dyn Element> {
        self.elements.get(index).map(|e| &**e)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Element> {
        self.elements.iter().map(|e| &**e)
    }

    /// Typed access to element `index`
    pub fn get<T: Any>(&self, index: usize) -> Option<&T> {
        (**self.elements.get(index)?).as_any().downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self, index: usize) -> bool {
        self.get::<T>(index).is_some()
    }

    /// True if element `index` is the atom `name`
    pub fn match_atom(&self, index: usize, name: &str) -> bool {
        self.get::<Atom>(index).map_or(false, |atom| atom == name)
    }

    /// True if this message holds exactly one element of type `T`
    pub fn is_single<T: Any>(&self) -> bool {
        self.len() == 1 && self.is::<T>(0)
    }

    /// Mutable access; detaches from other holders first
    pub fn get_mut<T: Any>(&mut self, index: usize) -> Option<&mut T> {
        let element = Arc::make_mut(&mut self.elements).get_mut(index)?;
        (**element).as_any_mut().downcast_mut::<T>()
    }

    /// Appends an element; detaches from other holders first
    pub fn push<T: Element>(&mut self, value: T) {
        Arc::make_mut(&mut self.elements).push(Box::new(value));
    }

    /// True if another `Message` shares this one's storage
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.elements) > 1
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|(lhs, rhs)| lhs.eq_element(rhs))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tuple = f.debug_tuple("");
        for element in self.iter() {
            tuple.field(&element);
        }
        tuple.finish()
    }
}

/// Builds a `Message` from a list of element expressions
///
/// ```
/// use lattice_codec::message;
/// use lattice_types::Atom;
///
/// let msg = message![Atom::from("ping"), 1i32];
/// assert!(msg.match_atom(0, "ping"));
/// assert_eq!(msg.get::<i32>(1), Some(&1));
/// ```
#[macro_export]
macro_rules! message {
    () => {
        $crate::Message::new()
    };
    ($($element:expr),+ $(,)?) => {
        $crate::Message::from_elements(vec![
            $(Box::new($element) as Box<dyn $crate::Element>),+
        ])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_access() {
        let msg = message![Atom::from("pong"), 2i32, String::from("x")];
        assert_eq!(msg.len(), 3);
        assert!(msg.match_atom(0, "pong"));
        assert_eq!(msg.get::<i32>(1), Some(&2));
        assert_eq!(msg.get::<u32>(1), None);
        assert_eq!(msg.get::<String>(2).map(String::as_str), Some("x"));
        assert!(msg.get::<i32>(9).is_none());
    }

    #[test]
    fn mutation_detaches_shared_storage() {
        let original = message![1u32, 2u32];
        let mut copy = original.clone();
        assert!(original.is_shared());

        *copy.get_mut::<u32>(0).unwrap() = 10;
        assert_eq!(original.get::<u32>(0), Some(&1));
        assert_eq!(copy.get::<u32>(0), Some(&10));
        assert!(!original.is_shared());
    }

    #[test]
    fn equality_is_elementwise() {
        assert_eq!(message![1i32, Atom::from("a")], message![1i32, Atom::from("a")]);
        assert_ne!(message![1i32], message![1u32]);
        assert_ne!(message![1i32], message![1i32, 2i32]);
        assert_eq!(message![], Message::new());
    }

    #[test]
    fn nested_messages_compare() {
        let inner = message![Atom::from("inner"), 3u8];
        let a = message![inner.clone(), 1i64];
        let b = message![inner, 1i64];
        assert_eq!(a, b);
        assert!(a.is::<Message>(0));
    }
}
