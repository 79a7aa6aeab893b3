use std::fmt;
use std::ops::{Deref, DerefMut};

use serde::de::{self, DeserializeOwned, Deserializer, Unexpected};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use unreachable::unreachable;

/// A JSON object, used for resource property bags and response data.
///
/// `null` and absent values decode to an empty map, since CloudFormation omits
/// `OldResourceProperties` on everything but updates.
#[derive(Clone, PartialEq)]
pub struct Map(Value);

impl Map {
    pub fn new() -> Self {
        Map(Value::Object(Default::default()))
    }

    /// Decodes the map into a typed properties struct.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.0)
    }

    fn from_value<E: de::Error>(v: Value) -> Result<Self, E> {
        let unexpected = match v {
            Value::Object(..) => return Ok(Map(v)),
            Value::Null => return Ok(Map::new()),
            Value::Bool(b) => Unexpected::Bool(b),
            Value::Number(..) => Unexpected::Other("number"),
            Value::String(ref s) => Unexpected::Str(s),
            Value::Array(..) => Unexpected::Seq,
        };
        Err(E::invalid_type(unexpected, &"a property map"))
    }
}

impl Default for Map {
    fn default() -> Self {
        Map::new()
    }
}

impl Deref for Map {
    type Target = serde_json::Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        match self.0 {
            Value::Object(ref map) => map,
            _ => unsafe { unreachable() },
        }
    }
}

impl DerefMut for Map {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.0 {
            Value::Object(ref mut map) => map,
            _ => unsafe { unreachable() },
        }
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.0, fmt)
    }
}

impl Serialize for Map {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> Deserialize<'de> for Map {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Value::deserialize(d).and_then(Map::from_value)
    }
}

impl FromIterator<(String, Value)> for Map {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Map(Value::Object(iter.into_iter().collect()))
    }
}
