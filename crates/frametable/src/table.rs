//! Method tables: the serializable description of a module's code and the
//! validated, lookup-friendly form the code manager consumes.

use mrt_unwinder::{GcRefKind, Reg};
use serde_derive::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

const W: isize = size_of::<usize>() as isize;

/// What kind of code a method table entry describes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MethodKind {
    /// An ordinary method body.
    #[default]
    Normal,
    /// A catch, finally or filter funclet. The word below its frame pointer
    /// holds the establisher (owner) frame pointer.
    Funclet,
    /// A method callable from native code. The word below its frame pointer
    /// holds the transition frame its native caller left behind.
    ReversePinvoke,
}

/// The kind of value a method returns, as far as the collector cares.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReturnKind {
    #[default]
    Scalar,
    Object,
    Byref,
}

impl From<ReturnKind> for GcRefKind {
    fn from(kind: ReturnKind) -> GcRefKind {
        match kind {
            ReturnKind::Scalar => GcRefKind::Scalar,
            ReturnKind::Object => GcRefKind::Object,
            ReturnKind::Byref => GcRefKind::Byref,
        }
    }
}

/// Live GC references at one code offset.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SafePointDesc {
    /// Offset from the method start.
    pub offset: usize,
    /// Frame-pointer-relative stack slots holding object references.
    #[serde(default)]
    pub slots: Vec<isize>,
    /// Frame-pointer-relative stack slots holding interior references.
    #[serde(default, rename = "interior-slots")]
    pub interior_slots: Vec<isize>,
    /// Registers holding object references, by assembler name.
    #[serde(default)]
    pub regs: Vec<String>,
}

/// One method table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodDesc {
    pub name: String,
    /// Address of the first instruction.
    pub start: usize,
    /// Code size in bytes.
    pub len: usize,
    /// Bytes of locals between the frame pointer and the stack pointer.
    #[serde(default, rename = "frame-size")]
    pub frame_size: usize,
    #[serde(default)]
    pub kind: MethodKind,
    #[serde(default)]
    pub returns: ReturnKind,
    /// Bytes of outgoing argument space above the stack pointer.
    #[serde(default, rename = "outgoing-args")]
    pub outgoing_args: usize,
    #[serde(default, rename = "safe-points")]
    pub safe_points: Vec<SafePointDesc>,
}

impl MethodDesc {
    /// An ordinary method with no locals and no safe points.
    pub fn new(name: &str, start: usize, len: usize) -> MethodDesc {
        MethodDesc {
            name: name.to_string(),
            start,
            len,
            frame_size: 0,
            kind: MethodKind::Normal,
            returns: ReturnKind::Scalar,
            outgoing_args: 0,
            safe_points: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: MethodKind) -> MethodDesc {
        self.kind = kind;
        if kind != MethodKind::Normal && self.frame_size == 0 {
            self.frame_size = size_of::<usize>();
        }
        self
    }

    pub fn with_frame_size(mut self, frame_size: usize) -> MethodDesc {
        self.frame_size = frame_size;
        self
    }

    pub fn with_returns(mut self, returns: ReturnKind) -> MethodDesc {
        self.returns = returns;
        self
    }

    pub fn with_outgoing_args(mut self, outgoing_args: usize) -> MethodDesc {
        self.outgoing_args = outgoing_args;
        self
    }

    pub fn with_safe_point(mut self, safe_point: SafePointDesc) -> MethodDesc {
        self.safe_points.push(safe_point);
        self
    }
}

/// Errors found while validating a method table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("method `{0}` has no code")]
    EmptyMethod(String),
    #[error("methods `{first}` and `{second}` overlap")]
    Overlap { first: String, second: String },
    #[error("method `{method}` frame size {size} is not a whole number of words")]
    FrameSize { method: String, size: usize },
    #[error("{kind:?} method `{method}` needs a frame slot below its frame pointer")]
    MissingFrameSlot { method: String, kind: MethodKind },
    #[error("safe point at offset {offset:#x} lies outside method `{method}`")]
    SafePointOutOfRange { method: String, offset: usize },
    #[error("method `{method}` reports invalid stack slot {offset}")]
    BadSlot { method: String, offset: isize },
    #[error("method `{method}` reports unknown register `{name}`")]
    UnknownRegister { method: String, name: String },
    #[error("no method named `{0}`")]
    UnknownMethod(String),
}

/// A reported GC root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    /// A stack slot at a frame-pointer-relative offset.
    Slot { fp_offset: isize, interior: bool },
    /// A register.
    Reg(Reg),
}

/// Live roots at one code offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafePoint {
    pub offset: usize,
    pub roots: SmallVec<[Root; 4]>,
}

/// A validated method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub name: String,
    pub start: usize,
    pub end: usize,
    pub frame_size: usize,
    pub kind: MethodKind,
    pub returns: GcRefKind,
    pub outgoing_args: usize,
    /// Sorted by offset.
    pub safe_points: Vec<SafePoint>,
}

impl Method {
    fn from_desc(desc: MethodDesc) -> Result<Method, TableError> {
        let name = desc.name;
        if desc.len == 0 {
            return Err(TableError::EmptyMethod(name));
        }
        if desc.frame_size % size_of::<usize>() != 0 {
            return Err(TableError::FrameSize {
                method: name,
                size: desc.frame_size,
            });
        }
        if desc.kind != MethodKind::Normal && desc.frame_size == 0 {
            return Err(TableError::MissingFrameSlot {
                method: name,
                kind: desc.kind,
            });
        }

        let mut safe_points = Vec::with_capacity(desc.safe_points.len());
        for sp in desc.safe_points {
            if sp.offset >= desc.len {
                return Err(TableError::SafePointOutOfRange {
                    method: name,
                    offset: sp.offset,
                });
            }
            let mut roots = SmallVec::new();
            let slots = sp.slots.iter().map(|o| (*o, false));
            let interior = sp.interior_slots.iter().map(|o| (*o, true));
            for (fp_offset, interior) in slots.chain(interior) {
                // The saved frame pointer, the return address and the special
                // slot of funclets and reverse P/Invoke methods are never roots.
                let reserved = fp_offset == 0
                    || fp_offset == W
                    || (desc.kind != MethodKind::Normal && fp_offset == -W);
                if fp_offset % W != 0 || reserved || fp_offset < -(desc.frame_size as isize) {
                    return Err(TableError::BadSlot {
                        method: name,
                        offset: fp_offset,
                    });
                }
                roots.push(Root::Slot {
                    fp_offset,
                    interior,
                });
            }
            for reg_name in sp.regs {
                match Reg::from_name(&reg_name) {
                    Some(reg) => roots.push(Root::Reg(reg)),
                    None => {
                        return Err(TableError::UnknownRegister {
                            method: name,
                            name: reg_name,
                        });
                    }
                }
            }
            safe_points.push(SafePoint {
                offset: sp.offset,
                roots,
            });
        }
        safe_points.sort_by_key(|sp| sp.offset);

        Ok(Method {
            name,
            start: desc.start,
            end: desc.start + desc.len,
            frame_size: desc.frame_size,
            kind: desc.kind,
            returns: desc.returns.into(),
            outgoing_args: desc.outgoing_args,
            safe_points,
        })
    }

    pub fn contains(&self, pc: usize) -> bool {
        self.start <= pc && pc < self.end
    }

    /// The safe point at exactly `pc`, if any.
    pub fn safe_point_at(&self, pc: usize) -> Option<&SafePoint> {
        let offset = pc.checked_sub(self.start)?;
        self.safe_points
            .binary_search_by_key(&offset, |sp| sp.offset)
            .ok()
            .map(|i| &self.safe_points[i])
    }

    /// The first safe point at or after `pc`, if any.
    pub fn next_safe_point(&self, pc: usize) -> Option<&SafePoint> {
        let offset = pc.checked_sub(self.start)?;
        let i = self.safe_points.partition_point(|sp| sp.offset < offset);
        self.safe_points.get(i)
    }
}

/// A validated, address-sorted method table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameTable {
    methods: Vec<Method>,
}

impl FrameTable {
    /// Validate `descs` and build a table from them.
    pub fn new(descs: impl IntoIterator<Item = MethodDesc>) -> Result<FrameTable, TableError> {
        let mut methods = descs
            .into_iter()
            .map(Method::from_desc)
            .collect::<Result<Vec<_>, _>>()?;
        methods.sort_by_key(|m| m.start);
        for pair in methods.windows(2) {
            if pair[0].end > pair[1].start {
                return Err(TableError::Overlap {
                    first: pair[0].name.clone(),
                    second: pair[1].name.clone(),
                });
            }
        }
        log::debug!("frame table with {} methods", methods.len());
        Ok(FrameTable { methods })
    }

    /// The method containing `pc`, with its index.
    pub fn lookup(&self, pc: usize) -> Option<(usize, &Method)> {
        let i = self.methods.partition_point(|m| m.end <= pc);
        let method = self.methods.get(i)?;
        method.contains(pc).then_some((i, method))
    }

    pub fn method(&self, index: usize) -> Option<&Method> {
        self.methods.get(index)
    }

    pub fn by_name(&self, name: &str) -> Result<&Method, TableError> {
        self.methods
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| TableError::UnknownMethod(name.to_string()))
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// The `[start, end)` range spanning every method.
    pub fn code_range(&self) -> Option<(usize, usize)> {
        let first = self.methods.first()?;
        let last = self.methods.last()?;
        Some((first.start, last.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> FrameTable {
        FrameTable::new([
            MethodDesc::new("b", 0x2000, 0x100),
            MethodDesc::new("a", 0x1000, 0x100).with_frame_size(16).with_safe_point(
                SafePointDesc {
                    offset: 0x20,
                    slots: vec![-8],
                    interior_slots: vec![-16],
                    regs: vec![Reg::FP.name().to_string()],
                },
            ),
        ])
        .unwrap()
    }

    #[test]
    fn lookup_by_address() {
        let t = table();
        assert_eq!(t.lookup(0x1000).map(|(_, m)| m.name.as_str()), Some("a"));
        assert_eq!(t.lookup(0x20ff).map(|(_, m)| m.name.as_str()), Some("b"));
        assert!(t.lookup(0x1100).is_none());
        assert!(t.lookup(0xfff).is_none());
        assert_eq!(t.code_range(), Some((0x1000, 0x2100)));
    }

    #[test]
    fn safe_point_lookup() {
        let t = table();
        let a = t.by_name("a").unwrap();
        let sp = a.safe_point_at(0x1020).unwrap();
        assert_eq!(sp.roots.len(), 3);
        assert!(a.safe_point_at(0x1021).is_none());
        assert_eq!(a.next_safe_point(0x1004).map(|sp| sp.offset), Some(0x20));
        assert!(a.next_safe_point(0x1021).is_none());
    }

    #[test]
    fn rejects_overlap() {
        let err = FrameTable::new([
            MethodDesc::new("a", 0x1000, 0x100),
            MethodDesc::new("b", 0x10f0, 0x100),
        ])
        .unwrap_err();
        assert!(matches!(err, TableError::Overlap { .. }));
    }

    #[test]
    fn rejects_bad_descriptions() {
        let bad_slot = MethodDesc::new("a", 0x1000, 0x100)
            .with_frame_size(16)
            .with_safe_point(SafePointDesc {
                offset: 0,
                slots: vec![8],
                ..SafePointDesc::default()
            });
        assert!(matches!(
            FrameTable::new([bad_slot]),
            Err(TableError::BadSlot { offset: 8, .. })
        ));

        let funclet = MethodDesc {
            kind: MethodKind::Funclet,
            ..MethodDesc::new("f", 0x1000, 0x10)
        };
        assert!(matches!(
            FrameTable::new([funclet]),
            Err(TableError::MissingFrameSlot { .. })
        ));

        let unknown_reg = MethodDesc::new("a", 0x1000, 0x100).with_safe_point(SafePointDesc {
            offset: 0,
            regs: vec!["not-a-register".to_string()],
            ..SafePointDesc::default()
        });
        assert!(matches!(
            FrameTable::new([unknown_reg]),
            Err(TableError::UnknownRegister { .. })
        ));

        assert_eq!(
            FrameTable::new([MethodDesc::new("e", 0x1000, 0)]),
            Err(TableError::EmptyMethod("e".to_string()))
        );
    }

    #[test]
    fn deserializes_from_toml() {
        #[derive(serde_derive::Deserialize)]
        struct Doc {
            methods: Vec<MethodDesc>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[methods]]
            name = "Run"
            start = 0x4000
            len = 0x80
            frame-size = 32
            kind = "reverse-pinvoke"
            returns = "object"

            [[methods.safe-points]]
            offset = 0x10
            slots = [-16, -24]
            "#,
        )
        .unwrap();
        let table = FrameTable::new(doc.methods).unwrap();
        let run = table.by_name("Run").unwrap();
        assert_eq!(run.kind, MethodKind::ReversePinvoke);
        assert_eq!(run.returns, GcRefKind::Object);
        assert_eq!(run.safe_points[0].roots.len(), 2);
    }
}
