// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Minimal XML writer for Query protocol responses.

use std::borrow::Cow;
use std::fmt::Display;

/// Escape text content and attribute values.
pub fn escape(input: &str) -> Cow<'_, str> {
    if !input.contains(['<', '>', '&', '"', '\'']) {
        return Cow::Borrowed(input);
    }
    let mut out = String::with_capacity(input.len() + 8);
    for ch in input.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// Streaming XML builder. Elements are closed in LIFO order; `finish`
/// closes whatever is still open.
#[derive(Debug)]
pub struct XmlWriter {
    buf: String,
    open: Vec<String>,
}

impl XmlWriter {
    /// Start a document whose root element declares `namespace`.
    pub fn document(root: &str, namespace: Option<&str>) -> Self {
        let mut buf = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        match namespace {
            Some(ns) => {
                buf.push_str(&format!("<{root} xmlns=\"{}\">", escape(ns)));
            }
            None => buf.push_str(&format!("<{root}>")),
        }
        Self {
            buf,
            open: vec![root.to_string()],
        }
    }

    pub fn open(&mut self, tag: &str) -> &mut Self {
        self.buf.push('<');
        self.buf.push_str(tag);
        self.buf.push('>');
        self.open.push(tag.to_string());
        self
    }

    pub fn close(&mut self) -> &mut Self {
        if let Some(tag) = self.open.pop() {
            self.buf.push_str("</");
            self.buf.push_str(&tag);
            self.buf.push('>');
        }
        self
    }

    /// Write `<tag>value</tag>`.
    pub fn element(&mut self, tag: &str, value: impl Display) -> &mut Self {
        let text = value.to_string();
        self.buf
            .push_str(&format!("<{tag}>{}</{tag}>", escape(&text)));
        self
    }

    /// Write the element only when `value` is present.
    pub fn optional<T: Display>(&mut self, tag: &str, value: Option<T>) -> &mut Self {
        if let Some(value) = value {
            self.element(tag, value);
        }
        self
    }

    /// Write an empty `<tag/>`.
    pub fn empty(&mut self, tag: &str) -> &mut Self {
        self.buf.push_str(&format!("<{tag}/>"));
        self
    }

    pub fn finish(mut self) -> String {
        while !self.open.is_empty() {
            self.close();
        }
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(escape("plain"), "plain");
        assert!(matches!(escape("plain"), Cow::Borrowed(_)));
        assert_eq!(escape("a<b & \"c\""), "a&lt;b &amp; &quot;c&quot;");
    }

    #[test]
    fn test_writer_nesting() {
        let mut w = XmlWriter::document("CreateVpcResponse", Some("urn:test"));
        w.element("requestId", "r-1")
            .open("vpc")
            .element("vpcId", "vpc-1")
            .optional::<&str>("missing", None)
            .close();
        let xml = w.finish();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"));
        assert!(xml.contains(
            "<CreateVpcResponse xmlns=\"urn:test\"><requestId>r-1</requestId><vpc><vpcId>vpc-1</vpcId></vpc></CreateVpcResponse>"
        ));
        assert!(!xml.contains("missing"));
    }

    #[test]
    fn test_finish_closes_open_elements() {
        let mut w = XmlWriter::document("Root", None);
        w.open("a").open("b");
        assert!(w.finish().ends_with("<Root><a><b></b></a></Root>"));
    }
}
