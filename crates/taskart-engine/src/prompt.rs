use taskart_contracts::request::{GenerationRequest, ImageStyle};

/// Keyword → setting. The first keyword found in the title or description
/// (lowercased, whole word) places the scene.
const PLACE_TABLE: &[(&str, &str)] = &[
    ("office", "in a bright office"),
    ("meeting", "in a meeting room"),
    ("report", "at a tidy desk"),
    ("email", "at a laptop on a desk"),
    ("kitchen", "in a cozy kitchen"),
    ("cook", "in a cozy kitchen"),
    ("groceries", "in a grocery store aisle"),
    ("shop", "in a small shop"),
    ("gym", "in a gym"),
    ("run", "on a park running path"),
    ("walk", "on a leafy sidewalk"),
    ("dog", "in a sunny park"),
    ("garden", "in a garden"),
    ("beach", "on a sandy beach"),
    ("school", "in a classroom"),
    ("study", "at a study desk with books"),
    ("doctor", "in a clinic waiting room"),
    ("dentist", "in a dentist's office"),
    ("bank", "in a bank lobby"),
    ("airport", "in an airport terminal"),
    ("flight", "in an airport terminal"),
    ("car", "next to a parked car"),
    ("clean", "in a living room"),
    ("laundry", "in a laundry room"),
];

pub fn style_phrase(style: ImageStyle) -> &'static str {
    match style {
        ImageStyle::Anime => {
            "Anime illustration style with clean line art, expressive faces and soft cel shading."
        }
        ImageStyle::Cartoon => {
            "Friendly cartoon style with bold outlines, rounded shapes and flat bright colors."
        }
        ImageStyle::Minimalist => {
            "Minimalist flat illustration with a limited palette, simple geometry and generous negative space."
        }
        ImageStyle::Watercolor => {
            "Soft watercolor painting with gentle washes, visible paper texture and light edges."
        }
        ImageStyle::Realistic => {
            "Photorealistic rendering with natural lighting, realistic materials and shallow depth of field."
        }
        ImageStyle::Pixel => {
            "Retro pixel art with a crisp 16-bit look, limited palette and no anti-aliasing."
        }
        ImageStyle::Sketch => {
            "Hand-drawn pencil sketch with confident strokes, light cross-hatching and minimal color."
        }
    }
}

/// Setting phrase for the first place keyword found in the request text.
pub fn detect_location(title: &str, description: Option<&str>) -> Option<&'static str> {
    let text = match description {
        Some(description) => format!("{title} {description}"),
        None => title.to_string(),
    }
    .to_ascii_lowercase();
    let words: Vec<&str> = text
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    PLACE_TABLE
        .iter()
        .find(|(keyword, _)| {
            words
                .iter()
                .any(|word| *word == *keyword || word.strip_suffix('s') == Some(*keyword))
        })
        .map(|(_, place)| *place)
}

/// Ordered directives making up the prompt.
pub fn prompt_directives(request: &GenerationRequest) -> Vec<String> {
    let mut directives = vec![
        "Create a high-quality illustration for a personal task list.".to_string(),
    ];

    let mut subject = format!("Show a person doing this task: {}", request.title());
    if let Some(place) = detect_location(request.title(), request.description()) {
        subject.push_str(&format!(", {place}"));
    }
    subject.push('.');
    if let Some(description) = request.description() {
        subject.push_str(&format!(" Details: {description}."));
    }
    match (request.reference_image(), request.profile_text()) {
        (Some(_), _) => subject.push_str(
            " The person should closely resemble the individual in the reference photo.",
        ),
        (None, Some(profile)) => {
            subject.push_str(&format!(" The person matches this description: {profile}."))
        }
        (None, None) => {}
    }
    directives.push(subject);

    directives.push(
        "Composition: one clear main character, centered, action readable at a glance, uncluttered framing."
            .to_string(),
    );
    directives.push(
        "Environment: simple background that supports the task, consistent lighting, no distracting props."
            .to_string(),
    );
    directives.push("Do not include any text, letters, numbers, logos or watermarks.".to_string());
    directives.push(style_phrase(request.style()).to_string());
    directives.push("Goal: the image must stay legible as a small square thumbnail.".to_string());
    directives
}

pub fn build_prompt(request: &GenerationRequest) -> String {
    prompt_directives(request).join("\n")
}

#[cfg(test)]
mod tests {
    use taskart_contracts::request::{GenerationRequest, ImageStyle};

    use super::{build_prompt, detect_location, prompt_directives, style_phrase};

    #[test]
    fn directives_follow_fixed_order() {
        let request = GenerationRequest::builder("Walk the dog")
            .description(Some("around the block"))
            .style(ImageStyle::Watercolor)
            .build();
        let directives = prompt_directives(&request);
        assert_eq!(directives.len(), 7);
        assert!(directives[0].starts_with("Create a high-quality illustration"));
        assert!(directives[1].contains("Walk the dog"));
        assert!(directives[1].contains("on a leafy sidewalk"));
        assert!(directives[1].contains("Details: around the block."));
        assert!(directives[2].starts_with("Composition:"));
        assert!(directives[3].starts_with("Environment:"));
        assert!(directives[4].contains("logos"));
        assert_eq!(directives[5], style_phrase(ImageStyle::Watercolor));
        assert!(directives[6].contains("thumbnail"));
    }

    #[test]
    fn prompt_is_deterministic() {
        let build = || {
            GenerationRequest::builder("Write report")
                .profile_text(Some("a tall woman with short red hair"))
                .style(ImageStyle::Anime)
                .build()
        };
        assert_eq!(build_prompt(&build()), build_prompt(&build()));
        assert!(build_prompt(&build()).contains("short red hair"));
    }

    #[test]
    fn reference_likeness_replaces_profile_text() {
        let request = GenerationRequest::builder("Cook dinner")
            .profile_text(Some("bearded"))
            .reference_image(Some("/photos/me.jpg"))
            .build();
        let prompt = build_prompt(&request);
        assert!(prompt.contains("reference photo"));
        assert!(!prompt.contains("bearded"));
    }

    #[test]
    fn location_matches_whole_words_and_plurals() {
        assert_eq!(detect_location("Buy groceries", None), Some("in a grocery store aisle"));
        assert_eq!(detect_location("Feed the dogs", None), Some("in a sunny park"));
        assert_eq!(detect_location("Prepare reports", None), Some("at a tidy desk"));
        assert_eq!(detect_location("Scarecrow repair", None), None);
        assert_eq!(detect_location("Errands", Some("pick up the car")), Some("next to a parked car"));
    }

    #[test]
    fn every_style_has_a_phrase() {
        for style in ImageStyle::ALL {
            assert!(!style_phrase(style).is_empty());
        }
    }
}
