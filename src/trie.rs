//! Component B — Address Trie (spec §4.2).
//!
//! One [`Trie`] covers the sub-address space under a single service root —
//! the Service Directory (`src/directory.rs`) owns one per `Local` entry and
//! resolves the leading `/service` segment itself before handing the rest of
//! the path down here. Handlers are closures plus an opaque cookie (design
//! note §9: "represent a handler as a closure/trait object plus its
//! cookie"); since the whole runtime is single-threaded (spec §5), `Rc`/
//! `RefCell` are sufficient — no `Arc`/`Mutex` needed anywhere in this type.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::message::Message;

pub type Cookie = Rc<dyn Any>;

/// One installed method: an optional required type descriptor (`None` is
/// the "no checking" sentinel), the coerce/parse flags, the cookie, and the
/// callback itself. Handler return values are ignored (spec §9 Open
/// Questions).
pub struct Handler {
    pub type_descriptor: Option<String>,
    pub coerce: bool,
    pub parse: bool,
    pub cookie: Cookie,
    callback: RefCell<Box<dyn FnMut(&Message, &Cookie)>>,
}

impl Handler {
    pub fn new(
        type_descriptor: Option<String>,
        coerce: bool,
        parse: bool,
        cookie: Cookie,
        callback: Box<dyn FnMut(&Message, &Cookie)>,
    ) -> Self {
        Handler { type_descriptor, coerce, parse, cookie, callback: RefCell::new(callback) }
    }

    /// `true` if `message` satisfies this handler's declared type descriptor,
    /// applying coercion only when both `coerce` and `parse` were requested
    /// (spec §4.1: "applied only when the caller requested both").
    fn accepts(&self, message: &Message) -> bool {
        let Some(want) = &self.type_descriptor else { return true };
        if want.len() != message.args.len() {
            return false;
        }
        if self.coerce && self.parse {
            want.chars()
                .zip(message.args.iter())
                .all(|(code, arg)| arg.coerce_to(code).is_some())
        } else {
            want.chars().zip(message.args.iter()).all(|(code, arg)| arg.type_code() == code)
        }
    }

    fn invoke(&self, message: &Message) {
        (self.callback.borrow_mut())(message, &self.cookie);
    }
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    handler: Option<Handler>,
}

/// A hierarchical map from path segments (below a service root) to handlers.
#[derive(Default)]
pub struct Trie {
    root: TrieNode,
}

impl Trie {
    pub fn new() -> Self {
        Trie::default()
    }

    /// Installs a handler at `path` (segments below the service root, no
    /// leading `/`). Intermediate segments are created as needed.
    pub fn insert(
        &mut self,
        path: &str,
        type_descriptor: Option<String>,
        coerce: bool,
        parse: bool,
        cookie: Cookie,
        callback: Box<dyn FnMut(&Message, &Cookie)>,
    ) {
        let mut node = &mut self.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.handler = Some(Handler::new(type_descriptor, coerce, parse, cookie, callback));
    }

    /// Removes the handler at `path`. Empty leaf nodes left behind by the
    /// removal are pruned so the trie returns to its pre-insert shape
    /// (spec §8: "inserting then removing a handler leaves the trie
    /// structurally equal to the pre-insert trie").
    pub fn remove(&mut self, path: &str) -> bool {
        fn recurse(node: &mut TrieNode, mut segments: std::str::Split<'_, char>) -> bool {
            match segments.next() {
                None => {
                    let had = node.handler.is_some();
                    node.handler = None;
                    had
                }
                Some(seg) if seg.is_empty() => recurse(node, segments),
                Some(seg) => {
                    let Some(child) = node.children.get_mut(seg) else { return false };
                    let removed = recurse(child, segments);
                    if child.handler.is_none() && child.children.is_empty() {
                        node.children.remove(seg);
                    }
                    removed
                }
            }
        }
        recurse(&mut self.root, path.split('/'))
    }

    /// Dispatches `message` against `path` (the address below the service
    /// root). Every handler whose label matches — possibly via OSC pattern
    /// semantics — is invoked, in stable depth-first, insertion order.
    /// Literal addresses (spec §3: leading `!`) disable pattern
    /// interpretation entirely.
    pub fn dispatch(&self, path: &str, literal: bool, message: &Message) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        Self::walk(&self.root, &segments, literal, message);
    }

    fn walk(node: &TrieNode, segments: &[&str], literal: bool, message: &Message) {
        match segments.split_first() {
            None => {
                if let Some(handler) = &node.handler {
                    if handler.accepts(message) {
                        handler.invoke(message);
                    }
                }
            }
            Some((seg, rest)) => {
                if literal || !is_pattern(seg) {
                    if let Some(child) = node.children.get(*seg) {
                        Self::walk(child, rest, literal, message);
                    }
                } else {
                    let pattern = compile_pattern(seg);
                    for (label, child) in node.children.iter() {
                        if pattern_matches(&pattern, label) {
                            Self::walk(child, rest, literal, message);
                        }
                    }
                }
            }
        }
    }
}

fn is_pattern(segment: &str) -> bool {
    segment.contains(['*', '?', '[', '{'])
}

/// A single pre-tokenized pattern segment, compiled once before it is
/// matched against any number of candidate labels (design note §9: "compile
/// each trie-level pattern to a small NFA once at insert time" — here,
/// "once per dispatch" since patterns arrive in messages, not in the trie).
#[derive(Debug, Clone)]
enum Tok {
    Literal(char),
    AnyRun,
    AnyOne,
    Set(Vec<(char, char)>, bool),
    Alt(Vec<String>),
}

fn compile_pattern(segment: &str) -> Vec<Tok> {
    let mut toks = Vec::new();
    let mut chars = segment.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => toks.push(Tok::AnyRun),
            '?' => toks.push(Tok::AnyOne),
            '[' => {
                let mut negate = false;
                if chars.peek() == Some(&'!') {
                    negate = true;
                    chars.next();
                }
                let mut ranges = Vec::new();
                while let Some(&c) = chars.peek() {
                    if c == ']' {
                        chars.next();
                        break;
                    }
                    chars.next();
                    if chars.peek() == Some(&'-') {
                        chars.next();
                        if let Some(&hi) = chars.peek() {
                            if hi != ']' {
                                chars.next();
                                ranges.push((c, hi));
                                continue;
                            }
                        }
                        ranges.push((c, c));
                        ranges.push(('-', '-'));
                    } else {
                        ranges.push((c, c));
                    }
                }
                toks.push(Tok::Set(ranges, negate));
            }
            '{' => {
                let mut alts = Vec::new();
                let mut cur = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    if c == ',' {
                        alts.push(std::mem::take(&mut cur));
                    } else {
                        cur.push(c);
                    }
                }
                alts.push(cur);
                toks.push(Tok::Alt(alts));
            }
            other => toks.push(Tok::Literal(other)),
        }
    }
    toks
}

fn pattern_matches(toks: &[Tok], candidate: &str) -> bool {
    match_rec(toks, &candidate.chars().collect::<Vec<_>>())
}

fn match_rec(toks: &[Tok], s: &[char]) -> bool {
    match toks.split_first() {
        None => s.is_empty(),
        Some((Tok::Literal(c), rest)) => {
            matches!(s.first(), Some(h) if h == c) && match_rec(rest, &s[1..])
        }
        Some((Tok::AnyOne, rest)) => !s.is_empty() && match_rec(rest, &s[1..]),
        Some((Tok::Set(ranges, negate), rest)) => match s.split_first() {
            Some((h, _)) => {
                let in_set = ranges.iter().any(|(lo, hi)| h >= lo && h <= hi);
                (in_set != *negate) && match_rec(rest, &s[1..])
            }
            None => false,
        },
        Some((Tok::Alt(alts), rest)) => alts.iter().any(|alt| {
            let alt_chars: Vec<char> = alt.chars().collect();
            s.len() >= alt_chars.len() && s[..alt_chars.len()] == alt_chars[..] && match_rec(rest, &s[alt_chars.len()..])
        }),
        Some((Tok::AnyRun, rest)) => {
            for split in 0..=s.len() {
                if match_rec(rest, &s[split..]) {
                    return true;
                }
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counting_handler() -> (Rc<Cell<u32>>, Box<dyn FnMut(&Message, &Cookie)>) {
        let count = Rc::new(Cell::new(0));
        let count_cl = count.clone();
        let cb: Box<dyn FnMut(&Message, &Cookie)> = Box::new(move |_msg, _cookie| {
            count_cl.set(count_cl.get() + 1);
        });
        (count, cb)
    }

    #[test]
    fn insert_then_remove_restores_shape() {
        let mut trie = Trie::new();
        let (_c, cb) = counting_handler();
        trie.insert("a/x", None, false, false, Rc::new(()), cb);
        assert!(trie.root.children.contains_key("a"));
        assert!(trie.remove("a/x"));
        assert!(trie.root.children.is_empty());
    }

    #[test]
    fn star_pattern_matches_multiple_children() {
        let mut trie = Trie::new();
        let (count_a, cb_a) = counting_handler();
        trie.insert("a/x", None, false, false, Rc::new(()), cb_a);
        let (count_b, cb_b) = counting_handler();
        trie.insert("b/x", None, false, false, Rc::new(()), cb_b);

        let msg = crate::message::MessageBuilder::new().seal(0.0, "/syn").unwrap();
        trie.dispatch("*/x", false, &msg);

        assert_eq!(count_a.get(), 1);
        assert_eq!(count_b.get(), 1);
    }

    #[test]
    fn literal_address_disables_patterns() {
        let mut trie = Trie::new();
        let (count, cb) = counting_handler();
        trie.insert("*", None, false, false, Rc::new(()), cb);
        let msg = crate::message::MessageBuilder::new().seal(0.0, "/syn").unwrap();
        trie.dispatch("*", true, &msg);
        assert_eq!(count.get(), 0, "literal addressing must not interpret '*' as a pattern");
    }

    #[test]
    fn type_descriptor_mismatch_skips_handler() {
        let mut trie = Trie::new();
        let (count, cb) = counting_handler();
        trie.insert("x", Some("i".to_string()), false, false, Rc::new(()), cb);
        let msg = crate::message::MessageBuilder::new().add_string("oops").seal(0.0, "/a").unwrap();
        trie.dispatch("x", false, &msg);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn set_and_alternation_patterns() {
        let mut trie = Trie::new();
        let (count, cb) = counting_handler();
        trie.insert("kick", None, false, false, Rc::new(()), cb);
        let msg = crate::message::MessageBuilder::new().seal(0.0, "/a").unwrap();
        trie.dispatch("{kick,snare}", false, &msg);
        assert_eq!(count.get(), 1);

        trie.dispatch("[jk]ick", false, &msg);
        assert_eq!(count.get(), 2, "k is a member of the set [jk] so this must match kick");
    }
}
