//! Data carried by a fire.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Payload of one fire, tagged by kind.
#[derive(Clone, Default)]
pub enum Payload {
    /// Plain fire.
    #[default]
    None,
    /// Fire carrying an integer.
    Long(i64),
    /// Fire carrying a shared object.
    Object(Arc<dyn Any + Send + Sync>),
}

impl Payload {
    /// Wrap `value` as an object payload.
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Payload::Object(Arc::new(value))
    }

    /// Integer carried, if any.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Payload::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Object carried, if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Payload::Object(obj) => obj.downcast_ref(),
            _ => None,
        }
    }

    /// Whether no data is carried.
    pub fn is_none(&self) -> bool {
        matches!(self, Payload::None)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::None => f.write_str("None"),
            Payload::Long(v) => f.debug_tuple("Long").field(v).finish(),
            Payload::Object(_) => f.write_str("Object(..)"),
        }
    }
}

impl From<i64> for Payload {
    fn from(v: i64) -> Self {
        Payload::Long(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        assert!(Payload::None.is_none());
        assert_eq!(Payload::from(7).as_long(), Some(7));
        let obj = Payload::object(String::from("x"));
        assert_eq!(obj.downcast_ref::<String>().map(String::as_str), Some("x"));
        assert!(obj.downcast_ref::<u32>().is_none());
        assert_eq!(format!("{:?}", obj), "Object(..)");
    }
}
