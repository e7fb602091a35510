//! NID: cross-process object address
//!
//! Layout of the packed form:
//! ┌────────────────────┬──────────────────────────────────────────┐
//! │ pid (10 bits)      │ local id (22 bits)                       │
//! └────────────────────┴──────────────────────────────────────────┘
//!
//! The type tag travels beside the packed value, never inside it. A NID only
//! means something inside the session whose registry issued it.

use std::fmt;

use super::kind::{KindTable, TypeTag};
use crate::error::NidError;

pub const ID_BITS: u32 = 22;
pub const MAX_ID: u32 = (1 << ID_BITS) - 1; // 4_194_303
pub const MAX_PID: u32 = (1 << (32 - ID_BITS)) - 1; // 1023

/// Pack `(pid, id)` into `(pid << 22) | id`.
///
/// Out-of-range parts are rejected rather than truncated so two objects can
/// never alias the same address.
#[inline]
pub fn encode(pid: u32, id: u32) -> Result<u32, NidError> {
    if pid > MAX_PID {
        return Err(NidError::PidOutOfRange(pid));
    }
    if id > MAX_ID {
        return Err(NidError::IdOutOfRange(id));
    }
    Ok((pid << ID_BITS) | id)
}

/// Inverse of [`encode`].
#[inline(always)]
pub fn decode(packed: u32) -> (u32, u32) {
    (packed >> ID_BITS, packed & MAX_ID)
}

/// Replicated object address: type tag, partition id, local id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Nid {
    tag: TypeTag,
    pid: u16,
    id: u32,
}

/// Fallback values for the parts a NID string leaves out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NidContext {
    pub tag: TypeTag,
    pub pid: u32,
}

impl Nid {
    pub const NULL: Nid = Nid {
        tag: TypeTag::NONE,
        pid: 0,
        id: 0,
    };

    pub fn new(tag: TypeTag, pid: u32, id: u32) -> Result<Self, NidError> {
        encode(pid, id)?;
        Ok(Self {
            tag,
            pid: pid as u16,
            id,
        })
    }

    /// Rebuild from the packed wire value.
    #[inline]
    pub fn from_packed(tag: TypeTag, packed: u32) -> Self {
        let (pid, id) = decode(packed);
        Self {
            tag,
            pid: pid as u16,
            id,
        }
    }

    #[inline(always)]
    pub fn packed(&self) -> u32 {
        ((self.pid as u32) << ID_BITS) | self.id
    }

    #[inline(always)]
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    #[inline(always)]
    pub fn pid(&self) -> u32 {
        self.pid as u32
    }

    #[inline(always)]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline(always)]
    pub fn is_null(&self) -> bool {
        self.id == 0
    }

    pub fn with_tag(self, tag: TypeTag) -> Self {
        Self { tag, ..self }
    }

    /// Human-readable form, `id[|TypeName][|pid]`.
    ///
    /// Tags missing from `kinds` are written as `#<tag>`.
    pub fn to_string_with(&self, kinds: &KindTable) -> String {
        let mut out = self.id.to_string();
        if self.tag != TypeTag::NONE {
            out.push('|');
            match kinds.name(self.tag) {
                Some(name) => out.push_str(name),
                None => {
                    out.push('#');
                    out.push_str(&self.tag.0.to_string());
                }
            }
        }
        if self.pid != 0 {
            out.push('|');
            out.push_str(&self.pid.to_string());
        }
        out
    }

    /// Parse any of `id`, `id|pid`, `id|TypeName`, `id|TypeName|pid`.
    ///
    /// Absent parts are taken from `ctx`. A numeric second part is a pid, a
    /// `#n` part is a raw tag, anything else a type name looked up in `kinds`.
    pub fn parse(s: &str, kinds: &KindTable, ctx: NidContext) -> Result<Self, NidError> {
        let malformed = || NidError::Malformed(s.to_string());
        let mut parts = s.trim().split('|');

        let id = parts
            .next()
            .and_then(|p| p.trim().parse::<u32>().ok())
            .ok_or_else(malformed)?;

        let mut tag = ctx.tag;
        let mut pid = ctx.pid;

        match (parts.next(), parts.next(), parts.next()) {
            (None, None, None) => {}
            (Some(second), None, None) => {
                let second = second.trim();
                if let Ok(p) = second.parse::<u32>() {
                    pid = p;
                } else {
                    tag = parse_tag(second, kinds, s)?;
                }
            }
            (Some(kind), Some(p), None) => {
                tag = parse_tag(kind.trim(), kinds, s)?;
                pid = p.trim().parse::<u32>().map_err(|_| malformed())?;
            }
            _ => return Err(malformed()),
        }

        Nid::new(tag, pid, id)
    }
}

fn parse_tag(part: &str, kinds: &KindTable, whole: &str) -> Result<TypeTag, NidError> {
    if let Some(raw) = part.strip_prefix('#') {
        return raw
            .parse::<u8>()
            .map(TypeTag)
            .map_err(|_| NidError::Malformed(whole.to_string()));
    }
    if part.is_empty() {
        return Err(NidError::Malformed(whole.to_string()));
    }
    kinds
        .by_name(part)
        .map(|k| k.tag)
        .ok_or_else(|| NidError::UnknownType(part.to_string()))
}

impl fmt::Display for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        if self.tag != TypeTag::NONE {
            write!(f, "|#{}", self.tag.0)?;
        }
        if self.pid != 0 {
            write!(f, "|{}", self.pid)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kind::KindInfo;
    use proptest::prelude::*;

    static ROWS: [KindInfo; 2] = [
        KindInfo::new(TypeTag(1), "Realm", false),
        KindInfo::new(TypeTag(2), "Army", true),
    ];
    static KINDS: KindTable = KindTable::new(&ROWS);

    #[test]
    fn test_encode_layout() {
        assert_eq!(encode(0, 1).unwrap(), 1);
        assert_eq!(encode(1, 0).unwrap(), 1 << 22);
        assert_eq!(encode(MAX_PID, MAX_ID).unwrap(), u32::MAX);
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert_eq!(encode(1024, 0), Err(NidError::PidOutOfRange(1024)));
        assert_eq!(encode(0, MAX_ID + 1), Err(NidError::IdOutOfRange(MAX_ID + 1)));
        assert!(Nid::new(TypeTag(1), 2000, 5).is_err());
    }

    #[test]
    fn test_string_forms() {
        let army = Nid::new(TypeTag(2), 7, 42).unwrap();
        assert_eq!(army.to_string_with(&KINDS), "42|Army|7");

        let realm = Nid::new(TypeTag(1), 0, 9).unwrap();
        assert_eq!(realm.to_string_with(&KINDS), "9|Realm");

        let bare = Nid::new(TypeTag::NONE, 3, 11).unwrap();
        assert_eq!(bare.to_string_with(&KINDS), "11|3");

        let unknown = Nid::new(TypeTag(77), 0, 5).unwrap();
        assert_eq!(unknown.to_string_with(&KINDS), "5|#77");
        assert_eq!(unknown.to_string(), "5|#77");
    }

    #[test]
    fn test_parse_falls_back_to_context() {
        let ctx = NidContext {
            tag: TypeTag(2),
            pid: 12,
        };
        let nid = Nid::parse("30", &KINDS, ctx).unwrap();
        assert_eq!((nid.tag(), nid.pid(), nid.id()), (TypeTag(2), 12, 30));

        let nid = Nid::parse("30|4", &KINDS, ctx).unwrap();
        assert_eq!((nid.tag(), nid.pid()), (TypeTag(2), 4));

        let nid = Nid::parse("30|Realm", &KINDS, ctx).unwrap();
        assert_eq!((nid.tag(), nid.pid()), (TypeTag(1), 12));
    }

    #[test]
    fn test_parse_errors() {
        let ctx = NidContext::default();
        assert!(matches!(
            Nid::parse("abc", &KINDS, ctx),
            Err(NidError::Malformed(_))
        ));
        assert!(matches!(
            Nid::parse("1|Dragon", &KINDS, ctx),
            Err(NidError::UnknownType(_))
        ));
        assert!(matches!(
            Nid::parse("1|Army|2|3", &KINDS, ctx),
            Err(NidError::Malformed(_))
        ));
        assert!(matches!(
            Nid::parse("1|Army|5000", &KINDS, ctx),
            Err(NidError::PidOutOfRange(5000))
        ));
    }

    proptest! {
        #[test]
        fn prop_encode_decode(pid in 0..=MAX_PID, id in 0..=MAX_ID) {
            let packed = encode(pid, id).unwrap();
            prop_assert_eq!(decode(packed), (pid, id));
        }

        #[test]
        fn prop_string_round_trip(
            tag in prop::sample::select(vec![0u8, 1, 2, 200]),
            pid in 0..=MAX_PID,
            id in 0..=MAX_ID,
        ) {
            let nid = Nid::new(TypeTag(tag), pid, id).unwrap();
            let text = nid.to_string_with(&KINDS);
            let parsed = Nid::parse(&text, &KINDS, NidContext::default()).unwrap();
            prop_assert_eq!(parsed, nid);
        }
    }
}
