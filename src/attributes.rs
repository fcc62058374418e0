/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

trait AttributeTrait: Any + Send + Sync + Debug {
    fn any_ref(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync + Debug> AttributeTrait for T {
    fn any_ref(&self) -> &dyn Any {
        self
    }
}

/// A collection of attributes indexed by their type.
///
/// `Attributes` provides a map-like interface where values are keyed by their
/// `TypeId`.  It is used to carry arbitrary typed data on addresses and in
/// channel arguments without the producers and consumers knowing about each
/// other.
///
/// The map is immutable: mutating operations return a new `Attributes` and
/// leave the original untouched, so a value handed to one component cannot be
/// changed under it by another.  Stored values are shared, which keeps the
/// copies cheap for the handful of entries these maps hold in practice.
#[derive(Clone, Default, Debug)]
pub struct Attributes {
    map: HashMap<TypeId, Arc<dyn AttributeTrait>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value to the attributes.
    /// Returns a new Attributes object with the value added.
    /// If a value of the same type already exists, it is replaced.
    pub fn add<T: Send + Sync + Debug + 'static>(&self, value: T) -> Self {
        let mut map = self.map.clone();
        map.insert(TypeId::of::<T>(), Arc::new(value));
        Attributes { map }
    }

    /// Gets a reference to a value of type T.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|v| v.any_ref().downcast_ref())
    }

    /// Removes a value of type T from the attributes.
    /// Returns a new Attributes object with the value removed.
    pub fn remove<T: 'static>(&self) -> Self {
        let mut map = self.map.clone();
        map.remove(&TypeId::of::<T>());
        Attributes { map }
    }

    /// Inserts all values from another Attributes object into this one.
    /// Returns a new Attributes object with the values added.
    /// If a value of the same type already exists, it is replaced by the value
    /// from `other`.
    pub fn union(&self, other: &Attributes) -> Self {
        let mut map = self.map.clone();
        for (k, v) in other.map.iter() {
            map.insert(*k, v.clone());
        }
        Attributes { map }
    }
}
