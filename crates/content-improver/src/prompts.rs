//! Instructions sent alongside each content document.

pub const ANALYZE_INSTRUCTIONS: &str = "\
You are reviewing website copy for a design-subscription agency. The JSON document below holds \
the text of one page section. Analyze it only; do not rewrite it.

Return ONLY a JSON object, with no prose and no code fences, shaped as:
{\"score\": <0-100 overall copy quality>, \"brand_alignment\": \"strong\" | \"moderate\" | \"weak\", \
\"issues\": [{\"field\": \"<dot path, e.g. hero.title or features[0].body>\", \"issue\": \"...\", \
\"suggestion\": \"...\", \"severity\": \"low\" | \"medium\" | \"high\"}]}";

pub const IMPROVE_INSTRUCTIONS: &str = "\
You are improving website copy for a design-subscription agency. Improve all human-readable text \
in the JSON document below: clearer, more concise, benefit-led, consistent in tone.

Rules:
- Keep every key, array length and non-text value exactly as it is.
- Change string values only.
- Return ONLY JSON, with no prose and no code fences.

Return either the complete improved document, or an object shaped as:
{\"improvements\": [{\"field\": \"<dot path>\", \"original\": \"...\", \"improved\": \"...\", \
\"reasoning\": \"...\", \"confidence\": <0-1>}], \
\"summary\": {\"quality_score\": <0-100>, \"brand_alignment\": \"strong\" | \"moderate\" | \"weak\"}}";

/// Instructions for one file, naming it so replies can be traced back in the provider's logs.
pub fn for_file(base: &str, file: &str) -> String {
    format!("{base}\n\nContent file: {file}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instructions_demand_json_only() {
        assert!(ANALYZE_INSTRUCTIONS.contains("Return ONLY a JSON object"));
        assert!(IMPROVE_INSTRUCTIONS.contains("Return ONLY JSON"));
        assert!(for_file(IMPROVE_INSTRUCTIONS, "pages/home.json").ends_with("Content file: pages/home.json"));
    }
}
