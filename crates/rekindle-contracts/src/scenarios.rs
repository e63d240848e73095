use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const PERSON_PLACEHOLDER: &str = "{historical_person}";

/// A named narrative template. Immutable once the catalog is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub title: String,
    pub description: String,
    pub emotional_tone: String,
    pub prompt: String,
}

/// Per-scenario palette for the synthesized placeholder graphic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioPalette {
    pub primary: &'static str,
    pub secondary: &'static str,
    pub accent: &'static str,
}

fn scenario(id: &str, title: &str, description: &str, tone: &str, prompt: &str) -> Scenario {
    Scenario {
        id: id.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        emotional_tone: tone.to_string(),
        prompt: prompt.to_string(),
    }
}

/// The fixed catalog, in display order.
pub fn scenario_catalog() -> IndexMap<String, Scenario> {
    let rows = [
        scenario(
            "wedding",
            "Wedding Celebration",
            "Show your loved one celebrating at a modern family wedding",
            "joyful",
            "A joyful family wedding celebration where {historical_person} is present, smiling and celebrating with the current family members at a beautiful outdoor ceremony",
        ),
        scenario(
            "graduation",
            "Graduation Day",
            "Capture the pride of graduation moments together",
            "proud",
            "A proud graduation ceremony where {historical_person} is present, beaming with pride as they celebrate this milestone with current family members",
        ),
        scenario(
            "holiday",
            "Holiday Gathering",
            "Recreate festive family holiday traditions",
            "warm",
            "A warm holiday family gathering where {historical_person} is naturally integrated, sharing in the festive traditions and joy with current family",
        ),
        scenario(
            "birthday",
            "Birthday Party",
            "Celebrate birthdays with multi-generational joy",
            "lively",
            "A lively birthday celebration where {historical_person} joins current family members in celebrating, sharing in the joy and laughter",
        ),
        scenario(
            "newborn",
            "Meeting New Baby",
            "Show the moment of meeting newest family members",
            "tender",
            "A tender moment where {historical_person} meets and holds the newest family member, surrounded by current family in a loving scene",
        ),
        scenario(
            "vacation",
            "Family Vacation",
            "Create memories of traveling together",
            "relaxed",
            "A relaxed family vacation scene where {historical_person} enjoys the destination and activities alongside current family members",
        ),
    ];

    rows.into_iter().map(|row| (row.id.clone(), row)).collect()
}

/// Unknown ids fall back to the wedding palette, matching the placeholder
/// renderer's behavior for stale scenario references.
pub fn palette_for(scenario_id: &str) -> ScenarioPalette {
    match scenario_id {
        "graduation" => ScenarioPalette {
            primary: "#dbeafe",
            secondary: "#2563eb",
            accent: "#059669",
        },
        "holiday" => ScenarioPalette {
            primary: "#fef3c7",
            secondary: "#d97706",
            accent: "#dc2626",
        },
        "birthday" => ScenarioPalette {
            primary: "#fed7e2",
            secondary: "#db2777",
            accent: "#7c3aed",
        },
        "newborn" => ScenarioPalette {
            primary: "#ecfdf5",
            secondary: "#059669",
            accent: "#f59e0b",
        },
        "vacation" => ScenarioPalette {
            primary: "#e0f2fe",
            secondary: "#0891b2",
            accent: "#ea580c",
        },
        _ => ScenarioPalette {
            primary: "#f3e8ff",
            secondary: "#9333ea",
            accent: "#ec4899",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::{palette_for, scenario_catalog, PERSON_PLACEHOLDER};

    #[test]
    fn catalog_has_six_scenarios_in_display_order() {
        let catalog = scenario_catalog();
        let ids: Vec<&str> = catalog.keys().map(String::as_str).collect();
        assert_eq!(
            ids,
            vec!["wedding", "graduation", "holiday", "birthday", "newborn", "vacation"]
        );
    }

    #[test]
    fn every_template_carries_the_placeholder() {
        for row in scenario_catalog().values() {
            assert!(
                row.prompt.contains(PERSON_PLACEHOLDER),
                "scenario {} is missing the placeholder",
                row.id
            );
        }
    }

    #[test]
    fn unknown_palette_falls_back_to_wedding() {
        assert_eq!(palette_for("unknown"), palette_for("wedding"));
        assert_ne!(palette_for("holiday"), palette_for("wedding"));
    }
}
