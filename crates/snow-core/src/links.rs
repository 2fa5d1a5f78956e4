//! Markdown link rewriting
//!
//! Finds the destination URLs of Markdown links and images and swaps them
//! between their public and preview forms. Destinations are replaced where
//! they are written in the source, so entity or escape encoded URLs are
//! matched by their decoded value.

use std::collections::HashMap;
use std::ops::Range;

use pulldown_cmark::{Event, LinkType, Parser, Tag, TagEnd};

/// Destination URLs of every link and image in `text`, deduplicated, in
/// order of first appearance
pub fn parse_links(text: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for event in Parser::new(text) {
        let dest = match event {
            Event::Start(Tag::Link { dest_url, .. }) => dest_url,
            Event::Start(Tag::Image { dest_url, .. }) => dest_url,
            _ => continue,
        };
        if !dest.is_empty() && !urls.iter().any(|u| u.as_str() == &*dest) {
            urls.push(dest.into_string());
        }
    }
    urls
}

/// Rewrite every link URL for which `lookup` returns a replacement
///
/// Unmatched URLs are left alone. `lookup` sees each decoded URL once.
/// Reference-style links are rewritten at their definition.
pub fn rewrite<E>(
    text: &str,
    mut lookup: impl FnMut(&str) -> Result<Option<String>, E>,
) -> Result<String, E> {
    let mut answers: HashMap<String, Option<String>> = HashMap::new();
    let mut edits: Vec<(Range<usize>, String)> = Vec::new();

    for dest in destinations(text) {
        if dest.url.is_empty() {
            continue;
        }
        if !answers.contains_key(&dest.url) {
            let answer = lookup(&dest.url)?.filter(|to| *to != dest.url);
            answers.insert(dest.url.clone(), answer);
        }
        if let Some(Some(to)) = answers.get(&dest.url) {
            let to = if !dest.bracketed && to.contains(char::is_whitespace) {
                format!("<{}>", to)
            } else {
                to.clone()
            };
            edits.push((dest.span, to));
        }
    }

    if edits.is_empty() {
        return Ok(text.to_string());
    }

    edits.sort_by_key(|(span, _)| span.start);
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (span, to) in edits {
        if span.start < cursor {
            continue;
        }
        out.push_str(&text[cursor..span.start]);
        out.push_str(&to);
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}

/// A link destination and the source bytes that spell it
struct Destination {
    url: String,
    span: Range<usize>,
    /// Already inside `<` and `>`
    bracketed: bool,
}

/// A link or image whose end has not been reached yet
struct OpenLink {
    link_type: LinkType,
    url: String,
    range: Range<usize>,
    /// End of the link text seen so far
    text_end: usize,
}

impl OpenLink {
    fn destination(&self, text: &str) -> Option<Destination> {
        match self.link_type {
            LinkType::Inline => {
                let rest = text.get(self.text_end..self.range.end)?;
                let from = self.text_end + rest.find("](")? + 2;
                let (span, bracketed) = scan_destination(text, from)?;
                Some(Destination {
                    url: self.url.clone(),
                    span,
                    bracketed,
                })
            }
            LinkType::Autolink => Some(Destination {
                url: self.url.clone(),
                span: self.range.start + 1..self.range.end.saturating_sub(1),
                bracketed: true,
            }),
            // Reference links are handled at their definitions
            _ => None,
        }
    }
}

/// Every rewritable destination in `text`
fn destinations(text: &str) -> Vec<Destination> {
    let mut found = Vec::new();
    let mut open: Vec<OpenLink> = Vec::new();
    let mut events = Parser::new(text).into_offset_iter();

    for (event, range) in events.by_ref() {
        match event {
            Event::Start(
                Tag::Link {
                    link_type,
                    dest_url,
                    ..
                }
                | Tag::Image {
                    link_type,
                    dest_url,
                    ..
                },
            ) => {
                if let Some(parent) = open.last_mut() {
                    parent.text_end = parent.text_end.max(range.end);
                }
                let marker = if text[range.start..].starts_with('!') { 2 } else { 1 };
                open.push(OpenLink {
                    link_type,
                    url: dest_url.into_string(),
                    text_end: range.start + marker,
                    range,
                });
            }
            Event::End(TagEnd::Link | TagEnd::Image) => {
                if let Some(link) = open.pop() {
                    found.extend(link.destination(text));
                    if let Some(parent) = open.last_mut() {
                        parent.text_end = parent.text_end.max(link.range.end);
                    }
                }
            }
            _ => {
                if let Some(link) = open.last_mut() {
                    link.text_end = link.text_end.max(range.end);
                }
            }
        }
    }

    for (_, def) in events.reference_definitions().iter() {
        let Some(source) = text.get(def.span.clone()) else {
            continue;
        };
        let Some(colon) = source.find("]:") else {
            continue;
        };
        if let Some((span, bracketed)) = scan_destination(text, def.span.start + colon + 2) {
            found.push(Destination {
                url: def.dest.to_string(),
                span,
                bracketed,
            });
        }
    }
    found
}

/// Find the raw destination starting at `from`, after optional whitespace
///
/// Returns its byte range and whether it is written as `<...>`.
fn scan_destination(text: &str, from: usize) -> Option<(Range<usize>, bool)> {
    let rest = text.get(from..)?;
    let start = from + (rest.len() - rest.trim_start().len());
    let rest = &text[start..];

    if let Some(inner) = rest.strip_prefix('<') {
        let mut escaped = false;
        for (i, c) in inner.char_indices() {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '>' => return Some((start + 1..start + 1 + i, true)),
                '\n' => return None,
                _ => {}
            }
        }
        return None;
    }

    let mut depth = 0usize;
    let mut escaped = false;
    let mut end = rest.len();
    for (i, c) in rest.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '(' => depth += 1,
            ')' if depth == 0 => {
                end = i;
                break;
            }
            ')' => depth -= 1,
            c if c.is_whitespace() || c.is_control() => {
                end = i;
                break;
            }
            _ => {}
        }
    }
    (end > 0).then(|| (start..start + end, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::convert::Infallible;

    fn table(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    fn apply(text: &str, map: &HashMap<String, String>) -> String {
        rewrite::<Infallible>(text, |url| Ok(map.get(url).cloned())).unwrap()
    }

    #[test]
    fn test_parse_links_and_images() {
        let text = "See [docs](https://example.com/docs) and ![cat](/media/cat.png).\n\
                    Again ![cat](/media/cat.png) and `[not](a-link)` in code.";
        assert_eq!(
            parse_links(text),
            vec!["https://example.com/docs", "/media/cat.png"]
        );
    }

    #[test]
    fn test_reference_style_links() {
        let text = "![logo][l]\n\n[l]: /media/logo.svg\n";
        assert_eq!(parse_links(text), vec!["/media/logo.svg"]);
    }

    #[test]
    fn test_rewrite_replaces_all_occurrences() {
        let map = table(&[("/media/a.png", "blob:snow/1")]);
        let text = "![a](/media/a.png) then [again](/media/a.png)";
        assert_eq!(
            apply(text, &map),
            "![a](blob:snow/1) then [again](blob:snow/1)"
        );
    }

    #[test]
    fn test_rewrite_round_trip() {
        let to_public = table(&[
            ("blob:snow/1", "/media/a.png"),
            ("blob:snow/2", "/media/b.png"),
        ]);
        let to_preview: HashMap<String, String> = to_public
            .iter()
            .map(|(k, v)| (v.clone(), k.clone()))
            .collect();

        let text = "![a](blob:snow/1)\n\nText ![b](blob:snow/2) [a](blob:snow/1)";
        let public = apply(text, &to_public);
        assert!(!public.contains("blob:"));
        assert_eq!(apply(&public, &to_preview), text);
    }

    #[test]
    fn test_text_without_links_is_unchanged() {
        let map = table(&[("/media/a.png", "blob:snow/1")]);
        let text = "Plain text mentioning /media/a.png but not linking it.";
        assert_eq!(apply(text, &map), text);
    }

    #[test]
    fn test_unknown_urls_are_untouched() {
        let map = table(&[("/media/a.png", "blob:snow/1")]);
        let text = "![x](/media/unknown.png)";
        assert_eq!(apply(text, &map), text);
    }

    #[test]
    fn test_longer_url_is_not_clobbered_by_prefix() {
        let map = table(&[
            ("/media/a.png", "blob:snow/1"),
            ("/media/a.png.webp", "blob:snow/2"),
        ]);
        let text = "![a](/media/a.png) ![b](/media/a.png.webp)";
        assert_eq!(apply(text, &map), "![a](blob:snow/1) ![b](blob:snow/2)");
    }

    #[test]
    fn test_encoded_destinations_are_rewritten() {
        let map = table(&[
            ("/media/a&b.png", "blob:snow/1"),
            ("/media/b_c.png", "blob:snow/2"),
            ("/media/my cat.png", "blob:snow/3"),
        ]);
        let text = concat!(
            "![a](/media/a&amp;b.png) ",
            "![b](/media/b\\_c.png \"Title\") ",
            "![c](</media/my cat.png>)"
        );
        assert_eq!(
            apply(text, &map),
            "![a](blob:snow/1) ![b](blob:snow/2 \"Title\") ![c](<blob:snow/3>)"
        );
    }

    #[test]
    fn test_rewrite_reference_definition_and_nested_image() {
        let map = table(&[("/media/logo.svg", "blob:snow/1"), ("/media/a.png", "blob:snow/2")]);
        let text = "![logo][l] [![a](/media/a.png)](/page)\n\n[l]: /media/logo.svg\n";
        assert_eq!(
            apply(text, &map),
            "![logo][l] [![a](blob:snow/2)](/page)\n\n[l]: blob:snow/1\n"
        );
    }

    #[test]
    fn test_replacement_with_spaces_is_bracketed() {
        let map = table(&[("blob:snow/1", "/media/my cat.png")]);
        assert_eq!(apply("![c](blob:snow/1)", &map), "![c](</media/my cat.png>)");
    }

    #[test]
    fn test_lookup_error_propagates() {
        let result = rewrite("![a](/media/a.png)", |_| Err::<Option<String>, _>("index down"));
        assert_eq!(result.unwrap_err(), "index down");
    }
}
