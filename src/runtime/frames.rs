//! Stack frames, their transport encoding, and the stack splice.
//!
//! A frame crosses the boundary as `type|callable|file|line`. A `|` inside a
//! field is replaced by `!`; a missing file is an empty field.

use std::fmt;

/// Line number carried by frames that denote a call across the boundary.
pub const NATIVE_LINE: i32 = -2;

const SEPARATOR: char = '|';
const SEPARATOR_ESCAPE: char = '!';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackFrame {
    pub type_name: String,
    pub callable: String,
    pub file: Option<String>,
    pub line: i32,
}

impl StackFrame {
    pub fn new(
        type_name: impl Into<String>,
        callable: impl Into<String>,
        file: Option<&str>,
        line: i32,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            callable: callable.into(),
            file: file.map(str::to_string),
            line,
        }
    }

    /// A frame marking a call across the boundary.
    pub fn boundary(type_name: impl Into<String>, callable: impl Into<String>) -> Self {
        Self::new(type_name, callable, None, NATIVE_LINE)
    }

    pub fn is_boundary(&self) -> bool {
        self.line == NATIVE_LINE
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_name, self.callable)?;
        match (&self.file, self.line) {
            (_, NATIVE_LINE) => write!(f, "(Native Method)"),
            (Some(file), line) if line >= 0 => write!(f, "({}:{})", file, line),
            (Some(file), _) => write!(f, "({})", file),
            (None, _) => write!(f, "(Unknown Source)"),
        }
    }
}

/// Predicate identifying boundary frames.
pub type BoundaryPredicate = dyn Fn(&StackFrame) -> bool + Send + Sync;

// =========================================================================
// Codec
// =========================================================================

fn escape(field: &str) -> String {
    field.replace(SEPARATOR, &SEPARATOR_ESCAPE.to_string())
}

pub fn encode_frame(frame: &StackFrame) -> String {
    format!(
        "{}{sep}{}{sep}{}{sep}{}",
        escape(&frame.type_name),
        escape(&frame.callable),
        frame.file.as_deref().map(escape).unwrap_or_default(),
        frame.line,
        sep = SEPARATOR
    )
}

/// `None` if the record does not have four fields or the line is not a
/// number.
pub fn decode_frame(record: &str) -> Option<StackFrame> {
    let mut fields = record.split(SEPARATOR);
    let type_name = fields.next()?;
    let callable = fields.next()?;
    let file = fields.next()?;
    let line = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(StackFrame {
        type_name: type_name.to_string(),
        callable: callable.to_string(),
        file: (!file.is_empty()).then(|| file.to_string()),
        line,
    })
}

pub fn encode_stack(frames: &[StackFrame]) -> Vec<String> {
    frames.iter().map(encode_frame).collect()
}

/// Decodes every record; malformed records are dropped.
pub fn decode_stack<S: AsRef<str>>(records: &[S]) -> Vec<StackFrame> {
    records
        .iter()
        .filter_map(|record| {
            let frame = decode_frame(record.as_ref());
            if frame.is_none() {
                tracing::warn!(target: "tscl_bridge", record = record.as_ref(), "dropping malformed frame record");
            }
            frame
        })
        .collect()
}

// =========================================================================
// Splice
// =========================================================================

/// Interleaves a foreign and a local stack into one trace.
///
/// Frames are copied from one side until a boundary frame is reached, then
/// from the other side, alternating until both are exhausted. Each segment
/// takes its first frame unconditionally, so adjacent boundary frames always
/// make progress. The first segment comes from the side the exception
/// originated in.
///
/// The result holds `foreign.len() - foreign_start + local.len() - local_start`
/// frames.
pub fn splice(
    foreign: &[StackFrame],
    local: &[StackFrame],
    foreign_start: usize,
    local_start: usize,
    originated_in_foreign: bool,
    is_boundary: &BoundaryPredicate,
) -> Vec<StackFrame> {
    let mut fi = foreign_start.min(foreign.len());
    let mut li = local_start.min(local.len());
    let mut merged = Vec::with_capacity(foreign.len() - fi + local.len() - li);
    let mut use_foreign = originated_in_foreign;

    while fi < foreign.len() || li < local.len() {
        if use_foreign {
            let mut starting = true;
            while fi < foreign.len() && (starting || !is_boundary(&foreign[fi])) {
                starting = false;
                merged.push(foreign[fi].clone());
                fi += 1;
            }
        } else {
            use_foreign = true;
        }
        let mut starting = true;
        while li < local.len() && (starting || !is_boundary(&local[li])) {
            starting = false;
            merged.push(local[li].clone());
            li += 1;
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(t: &str, c: &str) -> StackFrame {
        StackFrame::new(t, c, Some("Src.java"), 10)
    }

    fn boundary(t: &str, c: &str) -> StackFrame {
        StackFrame::boundary(t, c)
    }

    fn names(frames: &[StackFrame]) -> Vec<&str> {
        frames.iter().map(|f| f.callable.as_str()).collect()
    }

    #[test]
    fn test_frame_codec_roundtrip() {
        let frames = vec![
            StackFrame::new("a.B", "run", Some("B.java"), 42),
            StackFrame::new("a.C", "<init>", None, -1),
            StackFrame::boundary("a.D", "callNative"),
        ];
        let encoded = encode_stack(&frames);
        assert_eq!(encoded[0], "a.B|run|B.java|42");
        assert_eq!(encoded[1], "a.C|<init>||-1");
        assert_eq!(decode_stack(&encoded), frames);
    }

    #[test]
    fn test_separator_in_callable_is_escaped() {
        let frame = StackFrame::new("a.B", "lambda|0", Some("B.java"), 7);
        let encoded = encode_frame(&frame);
        assert_eq!(encoded, "a.B|lambda!0|B.java|7");

        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded.type_name, "a.B");
        assert_eq!(decoded.callable, "lambda!0");
        assert_eq!(decoded.file.as_deref(), Some("B.java"));
        assert_eq!(decoded.line, 7);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(decode_frame("a|b|c"), None);
        assert_eq!(decode_frame("a|b|c|x"), None);
        assert_eq!(decode_frame("a|b|c|1|2"), None);
        assert_eq!(decode_stack(&["a|b|c", "a|b||3"]).len(), 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(frame("a.B", "m").to_string(), "a.B.m(Src.java:10)");
        assert_eq!(boundary("a.B", "n").to_string(), "a.B.n(Native Method)");
        assert_eq!(
            StackFrame::new("a.B", "m", None, 3).to_string(),
            "a.B.m(Unknown Source)"
        );
    }

    #[test]
    fn test_splice_interleaves_at_boundaries() {
        // foreign: throw site, callback target, [call into local], caller
        let foreign = vec![
            frame("F", "throwSite"),
            frame("F", "callback"),
            boundary("F", "intoLocal"),
            frame("F", "main"),
        ];
        // local: call site, helper, [entry from foreign], rest
        let local = vec![
            frame("L", "callSite"),
            frame("L", "helper"),
            boundary("L", "entry"),
            frame("L", "outer"),
        ];
        let merged = splice(&foreign, &local, 0, 0, true, &StackFrame::is_boundary);
        assert_eq!(
            names(&merged),
            vec![
                "throwSite", "callback", "callSite", "helper", "intoLocal", "main", "entry",
                "outer"
            ]
        );
    }

    #[test]
    fn test_splice_respects_skips_and_length() {
        let foreign = vec![frame("F", "factory"), frame("F", "a"), boundary("F", "b")];
        let local = vec![
            frame("L", "bridgeInternal"),
            frame("L", "x"),
            boundary("L", "y"),
            frame("L", "z"),
        ];
        let merged = splice(&foreign, &local, 1, 1, false, &StackFrame::is_boundary);
        assert_eq!(merged.len(), foreign.len() - 1 + local.len() - 1);
        assert_eq!(names(&merged), vec!["x", "a", "y", "z", "b"]);
    }

    #[test]
    fn test_splice_terminates_on_adjacent_boundaries() {
        let foreign = vec![boundary("F", "a"), boundary("F", "b"), boundary("F", "c")];
        let local = vec![boundary("L", "x"), boundary("L", "y")];
        let merged = splice(&foreign, &local, 0, 0, true, &StackFrame::is_boundary);
        assert_eq!(names(&merged), vec!["a", "x", "b", "y", "c"]);
    }

    #[test]
    fn test_splice_without_boundaries_appends() {
        let foreign = vec![frame("F", "a"), frame("F", "b")];
        let local = vec![frame("L", "x")];
        let merged = splice(&foreign, &local, 0, 0, true, &StackFrame::is_boundary);
        assert_eq!(names(&merged), vec!["a", "b", "x"]);
    }

    #[test]
    fn test_splice_skip_past_end() {
        let foreign = vec![frame("F", "a")];
        let merged = splice(&foreign, &[], 5, 3, true, &StackFrame::is_boundary);
        assert!(merged.is_empty());
    }
}
