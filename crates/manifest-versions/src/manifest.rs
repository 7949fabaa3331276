use std::collections::BTreeMap;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesStart, BytesText, Event};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const ROOT_ELEMENT: &str = "manifest";
pub const VERSION_ATTR: &str = "version";
pub const REVISION_ATTR: &str = "revision";

/// The per-candidate annotation element kinds. At most one element of each
/// kind may exist in a published candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
    Android,
    Chrome,
}

impl AnnotationKind {
    pub fn tag(self) -> &'static str {
        match self {
            AnnotationKind::Android => "android",
            AnnotationKind::Chrome => "chrome",
        }
    }
}

fn xml_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::msg(format!("{context}: {e}"))
}

fn attrs_map(e: &BytesStart<'_>) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| xml_err("bad manifest attribute", e))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let val = attr
            .unescape_value()
            .map_err(|e| xml_err("bad manifest attribute value", e))?
            .to_string();
        out.insert(key, val);
    }
    Ok(out)
}

/// Inject `<android version="..."/>` or `<chrome version="..."/>` as a child
/// of the document root. If an element of that kind already exists the
/// manifest is returned unchanged, so repeated application cannot stack up
/// duplicates.
pub fn annotate(xml: &str, kind: AnnotationKind, version: &str) -> Result<String> {
    if extract_annotation(xml, kind)?.is_some() {
        return Ok(xml.to_string());
    }

    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut depth = 0usize;
    let mut injected = false;

    loop {
        let ev = reader
            .read_event()
            .map_err(|e| xml_err("manifest parse error", e))?;
        match ev {
            Event::Start(e) => {
                depth += 1;
                writer
                    .write_event(Event::Start(e))
                    .map_err(|e| xml_err("manifest write error", e))?;
            }
            Event::End(e) => {
                if depth == 1 && e.name().as_ref() == ROOT_ELEMENT.as_bytes() && !injected {
                    let mut elem = BytesStart::new(kind.tag());
                    elem.push_attribute((VERSION_ATTR, version));
                    writer
                        .write_event(Event::Text(BytesText::new("  ")))
                        .map_err(|e| xml_err("manifest write error", e))?;
                    writer
                        .write_event(Event::Empty(elem))
                        .map_err(|e| xml_err("manifest write error", e))?;
                    writer
                        .write_event(Event::Text(BytesText::new("\n")))
                        .map_err(|e| xml_err("manifest write error", e))?;
                    injected = true;
                }
                depth -= 1;
                writer
                    .write_event(Event::End(e))
                    .map_err(|e| xml_err("manifest write error", e))?;
            }
            Event::Eof => break,
            other => {
                writer
                    .write_event(other)
                    .map_err(|e| xml_err("manifest write error", e))?;
            }
        }
    }

    if !injected {
        return Err(Error::msg(format!(
            "manifest has no closing <{ROOT_ELEMENT}> element"
        )));
    }
    String::from_utf8(writer.into_inner()).map_err(|e| xml_err("manifest is not UTF-8", e))
}

/// Read the `version` attribute of the first annotation element of `kind`,
/// if present.
pub fn extract_annotation(xml: &str, kind: AnnotationKind) -> Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    loop {
        let ev = reader
            .read_event()
            .map_err(|e| xml_err("manifest parse error", e))?;
        match ev {
            Event::Start(e) | Event::Empty(e) => {
                if e.name().as_ref() == kind.tag().as_bytes() {
                    let attrs = attrs_map(&e)?;
                    return Ok(attrs.get(VERSION_ATTR).cloned());
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Rewrite the root element's `revision` attribute (adding it if absent).
pub fn set_root_revision(xml: &str, revision: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut depth = 0usize;

    loop {
        let ev = reader
            .read_event()
            .map_err(|e| xml_err("manifest parse error", e))?;
        match ev {
            Event::Start(e) => {
                if depth == 0 && e.name().as_ref() == ROOT_ELEMENT.as_bytes() {
                    let rewritten = with_revision(&e, revision)?;
                    writer
                        .write_event(Event::Start(rewritten))
                        .map_err(|e| xml_err("manifest write error", e))?;
                } else {
                    writer
                        .write_event(Event::Start(e))
                        .map_err(|e| xml_err("manifest write error", e))?;
                }
                depth += 1;
            }
            Event::End(e) => {
                depth -= 1;
                writer
                    .write_event(Event::End(e))
                    .map_err(|e| xml_err("manifest write error", e))?;
            }
            Event::Eof => break,
            other => {
                writer
                    .write_event(other)
                    .map_err(|e| xml_err("manifest write error", e))?;
            }
        }
    }
    String::from_utf8(writer.into_inner()).map_err(|e| xml_err("manifest is not UTF-8", e))
}

fn with_revision(e: &BytesStart<'_>, revision: &str) -> Result<BytesStart<'static>> {
    let mut out = BytesStart::new(ROOT_ELEMENT);
    for attr in e.attributes() {
        let attr = attr.map_err(|e| xml_err("bad manifest attribute", e))?;
        if attr.key.as_ref() == REVISION_ATTR.as_bytes() {
            continue;
        }
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let val = attr
            .unescape_value()
            .map_err(|e| xml_err("bad manifest attribute value", e))?
            .to_string();
        out.push_attribute((key.as_str(), val.as_str()));
    }
    out.push_attribute((REVISION_ATTR, revision));
    Ok(out)
}

/// Drop `<project>` entries whose `remote` attribute is not in the allow
/// list. An empty allow list keeps everything (no filtering configured).
pub fn filter_by_remote(xml: &str, allowed_remotes: &[String]) -> Result<String> {
    if allowed_remotes.is_empty() {
        return Ok(xml.to_string());
    }
    let keep = |attrs: &BTreeMap<String, String>| -> bool {
        match attrs.get("remote") {
            Some(r) => allowed_remotes.iter().any(|a| a == r),
            // Projects without an explicit remote ride on the default remote;
            // keep them.
            None => true,
        }
    };

    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut skip_depth = 0usize;

    loop {
        let ev = reader
            .read_event()
            .map_err(|e| xml_err("manifest parse error", e))?;
        match ev {
            Event::Start(e) => {
                if skip_depth > 0 {
                    skip_depth += 1;
                    continue;
                }
                if e.name().as_ref() == b"project" && !keep(&attrs_map(&e)?) {
                    skip_depth = 1;
                    continue;
                }
                writer
                    .write_event(Event::Start(e))
                    .map_err(|e| xml_err("manifest write error", e))?;
            }
            Event::Empty(e) => {
                if skip_depth > 0 {
                    continue;
                }
                if e.name().as_ref() == b"project" && !keep(&attrs_map(&e)?) {
                    continue;
                }
                writer
                    .write_event(Event::Empty(e))
                    .map_err(|e| xml_err("manifest write error", e))?;
            }
            Event::End(e) => {
                if skip_depth > 0 {
                    skip_depth -= 1;
                    continue;
                }
                writer
                    .write_event(Event::End(e))
                    .map_err(|e| xml_err("manifest write error", e))?;
            }
            Event::Eof => break,
            other => {
                if skip_depth > 0 {
                    continue;
                }
                writer
                    .write_event(other)
                    .map_err(|e| xml_err("manifest write error", e))?;
            }
        }
    }
    String::from_utf8(writer.into_inner()).map_err(|e| xml_err("manifest is not UTF-8", e))
}

/// Canonical, order-independent view of a manifest used for change
/// detection. Projects under an ignored path prefix and the per-candidate
/// annotation elements are excluded; the root attributes (including
/// `revision`) are not, so a root revision change is a real difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestSummary {
    root_attrs: BTreeMap<String, String>,
    elements: BTreeMap<String, BTreeMap<String, String>>,
}

fn is_annotation_tag(tag: &str) -> bool {
    tag == AnnotationKind::Android.tag() || tag == AnnotationKind::Chrome.tag()
}

pub fn summarize(xml: &str, ignored_prefixes: &[String]) -> Result<ManifestSummary> {
    let ignored = |attrs: &BTreeMap<String, String>| -> bool {
        let Some(path) = attrs.get("path").or_else(|| attrs.get("name")) else {
            return false;
        };
        ignored_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    };

    let mut reader = Reader::from_str(xml);
    let mut summary = ManifestSummary {
        root_attrs: BTreeMap::new(),
        elements: BTreeMap::new(),
    };
    let mut depth = 0usize;
    let mut skip_depth = 0usize;
    let mut anon = 0usize;

    let mut record =
        |summary: &mut ManifestSummary, tag: String, attrs: BTreeMap<String, String>| {
            let ident = attrs
                .get("path")
                .or_else(|| attrs.get("name"))
                .cloned()
                .unwrap_or_else(|| {
                    anon += 1;
                    format!("#{anon}")
                });
            summary.elements.insert(format!("{tag}:{ident}"), attrs);
        };

    loop {
        let ev = reader
            .read_event()
            .map_err(|e| xml_err("manifest parse error", e))?;
        match ev {
            Event::Start(e) => {
                if skip_depth > 0 {
                    skip_depth += 1;
                    depth += 1;
                    continue;
                }
                let attrs = attrs_map(&e)?;
                if depth == 0 {
                    if e.name().as_ref() != ROOT_ELEMENT.as_bytes() {
                        return Err(Error::msg(format!(
                            "expected <{ROOT_ELEMENT}> document root"
                        )));
                    }
                    summary.root_attrs = attrs;
                } else if depth == 1 {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    if is_annotation_tag(&tag) || (tag == "project" && ignored(&attrs)) {
                        skip_depth = 1;
                        depth += 1;
                        continue;
                    }
                    record(&mut summary, tag, attrs);
                }
                depth += 1;
            }
            Event::Empty(e) => {
                if skip_depth > 0 {
                    continue;
                }
                if depth == 1 {
                    let attrs = attrs_map(&e)?;
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    if is_annotation_tag(&tag) || (tag == "project" && ignored(&attrs)) {
                        continue;
                    }
                    record(&mut summary, tag, attrs);
                }
            }
            Event::End(_) => {
                depth -= 1;
                if skip_depth > 0 {
                    skip_depth -= 1;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(summary)
}

/// Content equality for change detection, per [`summarize`] rules.
pub fn manifests_equivalent(a: &str, b: &str, ignored_prefixes: &[String]) -> Result<bool> {
    Ok(summarize(a, ignored_prefixes)? == summarize(b, ignored_prefixes)?)
}

/// Stable content hash of the summarized manifest.
pub fn fingerprint(xml: &str, ignored_prefixes: &[String]) -> Result<String> {
    let summary = summarize(xml, ignored_prefixes)?;
    let encoded = serde_json::to_vec(&summary)
        .map_err(|e| Error::msg(format!("manifest fingerprint encode failed: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<manifest>
  <remote name="origin" fetch="https://example.com"/>
  <default remote="origin" revision="refs/heads/main"/>
  <project name="platform/core" path="core" revision="abc123"/>
  <project name="infra/specs" path="specs" revision="def456"/>
</manifest>
"#;

    #[test]
    fn annotate_injects_exactly_one_element() {
        let out = annotate(BASE, AnnotationKind::Android, "8675309").unwrap();
        assert_eq!(out.matches("<android").count(), 1);
        assert_eq!(
            extract_annotation(&out, AnnotationKind::Android).unwrap(),
            Some("8675309".to_string())
        );
        // The element is a child of the root.
        assert!(out.contains(r#"<android version="8675309"/>"#));
    }

    #[test]
    fn annotate_is_single_shot_per_kind() {
        let once = annotate(BASE, AnnotationKind::Android, "111").unwrap();
        let twice = annotate(&once, AnnotationKind::Android, "222").unwrap();
        assert_eq!(twice.matches("<android").count(), 1);
        // First write wins; re-annotation does not overwrite.
        assert_eq!(
            extract_annotation(&twice, AnnotationKind::Android).unwrap(),
            Some("111".to_string())
        );
    }

    #[test]
    fn android_and_chrome_annotations_coexist() {
        let out = annotate(BASE, AnnotationKind::Android, "1").unwrap();
        let out = annotate(&out, AnnotationKind::Chrome, "2").unwrap();
        assert_eq!(out.matches("<android").count(), 1);
        assert_eq!(out.matches("<chrome").count(), 1);
    }

    #[test]
    fn equivalence_ignores_listed_prefixes() {
        let changed = BASE.replace(
            r#"<project name="infra/specs" path="specs" revision="def456"/>"#,
            r#"<project name="infra/specs" path="specs" revision="zzz999"/>"#,
        );
        let ignore = vec!["specs".to_string()];
        assert!(manifests_equivalent(BASE, &changed, &ignore).unwrap());
        assert!(!manifests_equivalent(BASE, &changed, &[]).unwrap());
    }

    #[test]
    fn root_revision_attr_is_a_real_difference() {
        let marked = set_root_revision(BASE, "deadbeef").unwrap();
        assert!(marked.contains(r#"<manifest revision="deadbeef">"#));
        assert!(!manifests_equivalent(BASE, &marked, &[]).unwrap());

        let remarked = set_root_revision(BASE, "cafef00d").unwrap();
        assert!(!manifests_equivalent(&marked, &remarked, &[]).unwrap());
    }

    #[test]
    fn annotations_are_not_content_differences() {
        let annotated = annotate(BASE, AnnotationKind::Android, "8675309").unwrap();
        assert!(manifests_equivalent(BASE, &annotated, &[]).unwrap());
    }

    #[test]
    fn equivalence_is_attribute_order_independent() {
        let reordered = BASE.replace(
            r#"<project name="platform/core" path="core" revision="abc123"/>"#,
            r#"<project revision="abc123" path="core" name="platform/core"/>"#,
        );
        assert!(manifests_equivalent(BASE, &reordered, &[]).unwrap());
    }

    #[test]
    fn filter_drops_projects_on_other_remotes() {
        let xml = r#"<manifest>
  <remote name="ext" fetch="https://ext.example.com"/>
  <remote name="int" fetch="https://int.example.com"/>
  <project name="a" path="a" remote="ext"/>
  <project name="b" path="b" remote="int"/>
  <project name="c" path="c"/>
</manifest>
"#;
        let out = filter_by_remote(xml, &["ext".to_string()]).unwrap();
        assert!(out.contains(r#"name="a""#));
        assert!(!out.contains(r#"name="b""#));
        // No explicit remote means the default remote; kept.
        assert!(out.contains(r#"name="c""#));

        let unfiltered = filter_by_remote(xml, &[]).unwrap();
        assert!(unfiltered.contains(r#"name="b""#));
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = fingerprint(BASE, &[]).unwrap();
        let b = fingerprint(BASE, &[]).unwrap();
        assert_eq!(a, b);
        let marked = set_root_revision(BASE, "deadbeef").unwrap();
        assert_ne!(a, fingerprint(&marked, &[]).unwrap());
    }
}
