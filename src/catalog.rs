//! Capabilities of the travel assistant.
//!
//! The table only declares identifiers, dependencies and input fields.
//! Providers are supplied by the caller, which keeps network clients and
//! credentials out of the engine.

use std::sync::Arc;

use crate::core::{FieldKind, InputShape};
use crate::error::PlanError;
use crate::registry::{Capability, Provider, Registry};

/// Static description of a catalogue entry.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub id: &'static str,
    pub dependencies: &'static [&'static str],
    /// `(name, kind, required)`
    pub fields: &'static [(&'static str, FieldKind, bool)],
    pub summary: &'static str,
}

impl Entry {
    pub fn input_shape(&self) -> InputShape {
        self.fields
            .iter()
            .fold(InputShape::new(), |shape, &(name, kind, required)| {
                if required {
                    shape.required(name, kind)
                } else {
                    shape.optional(name, kind)
                }
            })
    }
}

pub const TRAVEL: &[Entry] = &[
    Entry {
        id: "weather",
        dependencies: &[],
        fields: &[
            ("location", FieldKind::String, true),
            ("days_ahead", FieldKind::Number, false),
        ],
        summary: "Forecast for the destination",
    },
    Entry {
        id: "navigator",
        dependencies: &[],
        fields: &[
            ("location", FieldKind::String, true),
            ("origin", FieldKind::String, false),
            ("date", FieldKind::String, false),
        ],
        summary: "Flights, local transport and places",
    },
    Entry {
        id: "env_hazards",
        dependencies: &[],
        fields: &[("location", FieldKind::String, true)],
        summary: "Air quality and environmental alerts",
    },
    Entry {
        id: "budget",
        dependencies: &[],
        fields: &[
            ("amount", FieldKind::Number, false),
            ("from_currency", FieldKind::String, false),
            ("to_currency", FieldKind::String, false),
        ],
        summary: "Currency conversion",
    },
    Entry {
        id: "culture_food",
        dependencies: &[],
        fields: &[
            ("location", FieldKind::String, false),
            ("cuisine", FieldKind::String, false),
        ],
        summary: "Local dishes and customs",
    },
    Entry {
        id: "language",
        dependencies: &[],
        fields: &[
            ("location", FieldKind::String, true),
            ("context", FieldKind::String, false),
        ],
        summary: "Phrasebook and pronunciation",
    },
    Entry {
        id: "safety",
        dependencies: &[],
        fields: &[("location", FieldKind::String, true)],
        summary: "Travel advisories",
    },
    Entry {
        id: "explorer",
        dependencies: &["weather"],
        fields: &[("mood", FieldKind::String, false)],
        summary: "Experiences suited to the weather",
    },
    Entry {
        id: "wardrobe",
        dependencies: &["weather"],
        fields: &[
            ("event", FieldKind::String, true),
            ("formality", FieldKind::String, false),
        ],
        summary: "Outfits for the event and the weather",
    },
    Entry {
        id: "memory",
        dependencies: &[],
        fields: &[("memory", FieldKind::String, true)],
        summary: "Remembers a user preference",
    },
    Entry {
        id: "search",
        dependencies: &[],
        fields: &[("query", FieldKind::String, true)],
        summary: "General web search",
    },
];

pub fn lookup(id: &str) -> Option<&'static Entry> {
    TRAVEL.iter().find(|entry| entry.id == id)
}

/// Registers every catalogue entry `resolver` has a provider for, in table
/// order. Returns how many capabilities were registered.
///
/// Entries without a provider are left out, so a dependent whose prerequisite
/// was left out fails planning with [`PlanError::UnknownCapability`].
pub fn register_travel<F>(registry: &mut Registry, mut resolver: F) -> Result<usize, PlanError>
where
    F: FnMut(&Entry) -> Option<Arc<dyn Provider>>,
{
    let mut count = 0;

    for entry in TRAVEL {
        let Some(provider) = resolver(entry) else {
            tracing::debug!("no provider for '{}', leaving it out", entry.id);
            continue;
        };

        let capability = Capability::new(entry.id, provider)
            .depends_on(entry.dependencies.iter().copied())
            .input(entry.input_shape());

        registry.register(capability)?;
        count += 1;
    }

    Ok(count)
}
