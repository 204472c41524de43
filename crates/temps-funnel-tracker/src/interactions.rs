//! Element interactions and application custom events

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::listeners::{Listener, ListenerId, Listeners};

/// Host-side model of a DOM element and its ancestry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<Element>>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn child_of(mut self, parent: Element) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    pub fn parent(&self) -> Option<&Element> {
        self.parent.as_deref()
    }

    /// This element followed by each ancestor up to the root
    pub fn ancestors_inclusive(&self) -> impl Iterator<Item = &Element> {
        std::iter::successors(Some(self), |el| el.parent())
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    /// Attribute value, with `id` and `class` reflecting their dedicated fields
    pub fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "id" => self.id.clone(),
            "class" if !self.classes.is_empty() => Some(self.classes.join(" ")),
            _ => self.attributes.get(name).cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Interaction {
    /// Click on an element
    Click(Element),
    /// Application-emitted custom event
    Custom(String),
}

/// Source of interactions the tracker listens to
pub struct InteractionBus {
    listeners: Listeners<Interaction>,
}

impl InteractionBus {
    pub fn new() -> Self {
        Self {
            listeners: Listeners::new(),
        }
    }

    pub fn click(&self, target: Element) {
        self.listeners.emit(&Interaction::Click(target));
    }

    pub fn custom(&self, name: impl Into<String>) {
        self.listeners.emit(&Interaction::Custom(name.into()));
    }

    pub fn subscribe(&self, listener: Listener<Interaction>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for InteractionBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_element_from_json() {
        let element: Element = serde_json::from_str(
            r#"{
                "tag": "button",
                "classes": ["btn"],
                "attributes": {"data-step": "2"},
                "parent": {"tag": "form", "id": "checkout"}
            }"#,
        )
        .unwrap();

        assert_eq!(element.attribute("data-step").as_deref(), Some("2"));
        assert_eq!(element.attribute("class").as_deref(), Some("btn"));
        assert_eq!(element.parent().unwrap().attribute("id").as_deref(), Some("checkout"));
        assert_eq!(element.ancestors_inclusive().count(), 2);
    }

    #[test]
    fn test_bus_delivers_to_subscribers() {
        let bus = InteractionBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        let id = bus.subscribe(Arc::new(move |interaction: &Interaction| {
            log.lock().push(interaction.clone());
        }));

        bus.custom("signup");
        bus.click(Element::new("a"));
        assert!(bus.unsubscribe(id));
        bus.custom("ignored");

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], Interaction::Custom("signup".to_string()));
        assert_eq!(bus.listener_count(), 0);
    }
}
