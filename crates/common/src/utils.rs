/// Upper-case ISO country code; empty input means every country ("ALL").
pub fn normalize_country(country: &str) -> String {
    let trimmed = country.trim();
    if trimmed.is_empty() {
        "ALL".to_string()
    } else {
        trimmed.to_uppercase()
    }
}

pub fn normalize_page_id(page_id: &str) -> String {
    page_id.trim().to_string()
}

/// Current wall-clock time as unix milliseconds
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_country() {
        assert_eq!(normalize_country(" de "), "DE");
        assert_eq!(normalize_country(""), "ALL");
    }

    #[test]
    fn test_normalize_page_id() {
        assert_eq!(normalize_page_id(" 12345\n"), "12345");
    }
}
