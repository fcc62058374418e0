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

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;

use crate::client::load_balancing::LbPolicyBuilder;

/// Maps LB policy names, as they appear in service configs, to the builders
/// that produce them.
///
/// pick_first is the only policy this crate ships, but channels resolve
/// every policy through the same by-name lookup, so crates layering richer
/// policies on top install their builders the same way.
pub(crate) struct LbPolicyRegistry {
    builders: Mutex<HashMap<&'static str, Arc<dyn LbPolicyBuilder>>>,
}

impl LbPolicyRegistry {
    fn new() -> Self {
        Self {
            builders: Mutex::new(HashMap::new()),
        }
    }

    /// Installs a builder under the name it reports.  Registering a second
    /// builder with the same name replaces the first.
    pub(crate) fn register(&self, builder: impl LbPolicyBuilder + 'static) {
        let builder: Arc<dyn LbPolicyBuilder> = Arc::new(builder);
        self.builders.lock().unwrap().insert(builder.name(), builder);
    }

    /// Returns the builder installed under the given name, if any.
    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<dyn LbPolicyBuilder>> {
        self.builders.lock().unwrap().get(name).cloned()
    }
}

/// The process-wide registry consulted when a service config names an LB
/// policy.  pick_first::reg() installs its builder here.
pub(crate) static GLOBAL_LB_REGISTRY: LazyLock<LbPolicyRegistry> =
    LazyLock::new(LbPolicyRegistry::new);
