use sage_protocol::{PersonalityTraits, TraitName};

const HIGH: f32 = 0.7;
const LOW: f32 = 0.3;

enum Band {
    Low,
    Mid,
    High,
}

fn band(traits: &PersonalityTraits, name: TraitName) -> Band {
    let value = traits.get(name);
    if value >= HIGH {
        Band::High
    } else if value <= LOW {
        Band::Low
    } else {
        Band::Mid
    }
}

/// Render the system style prompt. Output depends only on the inputs.
pub fn render_style_prompt(assistant_name: &str, traits: &PersonalityTraits) -> String {
    let mut lines = vec![format!("You are {assistant_name}, a personal assistant.")];

    lines.push(
        match band(traits, TraitName::Formality) {
            Band::High => "Use a formal, professional tone.",
            Band::Mid => "Use a natural, conversational tone.",
            Band::Low => "Use a casual, relaxed tone.",
        }
        .to_owned(),
    );
    lines.push(
        match band(traits, TraitName::Verbosity) {
            Band::High => "Give thorough answers with supporting detail.",
            Band::Mid => "Keep answers reasonably concise.",
            Band::Low => "Keep answers short and to the point.",
        }
        .to_owned(),
    );
    match band(traits, TraitName::Warmth) {
        Band::High => lines.push("Be warm and encouraging.".to_owned()),
        Band::Low => lines.push("Stay neutral and matter-of-fact.".to_owned()),
        Band::Mid => {}
    }
    match band(traits, TraitName::Humor) {
        Band::High => lines.push("Light humor is welcome when it fits.".to_owned()),
        Band::Low => lines.push("Avoid jokes.".to_owned()),
        Band::Mid => {}
    }
    match band(traits, TraitName::Confidence) {
        Band::High => lines.push("State conclusions directly.".to_owned()),
        Band::Low => lines.push("Point out uncertainty where it exists.".to_owned()),
        Band::Mid => {}
    }

    let flags = traits.flags();
    lines.push(if flags.use_markdown {
        "Format replies with Markdown when it helps readability.".to_owned()
    } else {
        "Reply in plain text without Markdown.".to_owned()
    });
    if !flags.use_emoji {
        lines.push("Do not use emoji.".to_owned());
    }
    if flags.ask_clarifying_questions {
        lines.push("Ask a clarifying question when a request is ambiguous.".to_owned());
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use sage_protocol::StyleFlags;

    use super::*;

    #[test]
    fn prompt_is_deterministic() {
        let traits = PersonalityTraits::default();
        assert_eq!(
            render_style_prompt("Sage", &traits),
            render_style_prompt("Sage", &traits)
        );
    }

    #[test]
    fn prompt_follows_trait_bands() {
        let mut traits = PersonalityTraits::default();
        traits.set(TraitName::Formality, 0.9);
        traits.set(TraitName::Verbosity, 0.1);
        let prompt = render_style_prompt("Sage", &traits);
        assert!(prompt.starts_with("You are Sage"));
        assert!(prompt.contains("formal, professional"));
        assert!(prompt.contains("short and to the point"));
        assert!(prompt.contains("Be warm"));
    }

    #[test]
    fn flags_toggle_formatting_lines() {
        let mut traits = PersonalityTraits::default();
        traits.set_flags(StyleFlags {
            use_markdown: false,
            use_emoji: true,
            ask_clarifying_questions: false,
        });
        let prompt = render_style_prompt("Sage", &traits);
        assert!(prompt.contains("plain text"));
        assert!(!prompt.contains("emoji"));
        assert!(!prompt.contains("clarifying"));
    }
}
