use uuid::Uuid;

/// Fresh random identifier for tabs and sections.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Lowercase `name` and collapse each whitespace run into a single `-`.
pub fn generate_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut in_space = false;
    for c in name.chars() {
        if c.is_whitespace() {
            if !in_space {
                slug.push('-');
            }
            in_space = true;
        } else {
            slug.extend(c.to_lowercase());
            in_space = false;
        }
    }
    slug
}
