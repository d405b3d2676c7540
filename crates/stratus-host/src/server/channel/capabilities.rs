use std::collections::HashMap;

/// How an incoming capability map is combined with the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Incoming keys overwrite, other keys stay (environment reload).
    Merge,
    /// The incoming map becomes the whole set (init).
    Replace,
}

/// Capabilities advertised by a worker.
///
/// Keys the host does not know are stored like any other; they are simply
/// never looked up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    values: HashMap<String, String>,
}

impl Capabilities {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Present with a value other than `false`.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name)
            .is_some_and(|value| !value.eq_ignore_ascii_case("false"))
    }

    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.values
    }

    /// Applies `incoming` and reports whether the set changed.
    pub fn update(&mut self, incoming: &HashMap<String, String>, strategy: UpdateStrategy) -> bool {
        let previous = self.values.clone();
        match strategy {
            UpdateStrategy::Replace => self.values = incoming.clone(),
            UpdateStrategy::Merge => self
                .values
                .extend(incoming.iter().map(|(k, v)| (k.clone(), v.clone()))),
        }
        previous != self.values
    }
}
