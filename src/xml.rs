//! Small XML helpers shared by the registry and location files

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;

use crate::errors::Result;

pub(crate) const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="utf-8"?>"#;

/// Name of the first element in `content`, if any
pub(crate) fn root_element_name(content: &str) -> Option<String> {
    let mut reader = Reader::from_str(content);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Serialize a document with declaration and trailing newline
pub(crate) fn to_document<T: Serialize>(value: &T) -> Result<String> {
    let body = quick_xml::se::to_string(value)?;
    Ok(format!("{XML_DECLARATION}\n{body}\n"))
}

/// Boolean attribute values as written by hand: yes/no, true/false, 1/0, on/off
pub(crate) fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Some(true),
        "no" | "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn format_flag(value: bool) -> String {
    if value { "yes" } else { "no" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_element_name() {
        assert_eq!(
            root_element_name("<?xml version=\"1.0\"?>\n<!-- c -->\n<remote server=\"a\"/>").as_deref(),
            Some("remote")
        );
        assert_eq!(root_element_name("<root><x/></root>").as_deref(), Some("root"));
        assert_eq!(root_element_name("").as_deref(), None);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("YES"), Some(true));
        assert_eq!(parse_flag(" no "), Some(false));
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag("maybe"), None);
    }
}
