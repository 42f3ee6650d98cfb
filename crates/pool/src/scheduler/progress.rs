//! Progress text for labelled pool runs.

/// Uppercase the first character of `s`.
pub fn upper_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Lowercase the first character of `s`.
pub fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Text shown while a labelled task runs, e.g. `Compiling sources...`.
pub fn running_text(task_name: &str) -> String {
    format!("{}...", upper_first(task_name))
}

/// Text shown once a labelled task finished, e.g. `Finished compiling sources.`.
pub fn finished_text(task_name: &str) -> String {
    format!("Finished {}.", lower_first(task_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_char_case() {
        assert_eq!(upper_first("compiling"), "Compiling");
        assert_eq!(lower_first("Bundling CSS"), "bundling CSS");
        assert_eq!(upper_first(""), "");
        assert_eq!(lower_first("ésbuild"), "ésbuild");
        assert_eq!(upper_first("ésbuild"), "Ésbuild");
    }

    #[test]
    fn progress_lines() {
        assert_eq!(running_text("compiling pages"), "Compiling pages...");
        assert_eq!(finished_text("Compiling pages"), "Finished compiling pages.");
    }
}
