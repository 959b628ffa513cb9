use smallvec::smallvec;
use tracing::{debug, warn};

use crate::{
    dex::{AssemblyError, CodeIr, CodeItem, DexFile, Instruction, MethodKey},
    types::{Behavior, EmptyListForm, LIST_DESCRIPTOR},
};

const COLLECTIONS: &str = "Ljava/util/Collections;";

/// Parameters occupy the top `ins_size` registers, so in a frame of
/// `ins_size + 1` this slot is always free.
const RESULT_REGISTER: u8 = 0;

/// Replaces method bodies with canned instruction sequences
#[derive(Debug, Clone, Copy, Default)]
pub struct BodyRewriter {
    pub empty_list_form: EmptyListForm,
}

impl BodyRewriter {
    pub fn new(empty_list_form: EmptyListForm) -> Self {
        BodyRewriter { empty_list_form }
    }

    /// Instructions implementing `behavior`, interning whatever they
    /// reference.
    pub fn canned_sequence(&self, dex: &mut DexFile, behavior: Behavior) -> CodeIr {
        let v0 = RESULT_REGISTER;
        match behavior {
            Behavior::ReturnTrue | Behavior::ReturnFalse => {
                let value = i8::from(behavior == Behavior::ReturnTrue);
                [
                    Instruction::Const4 { dst: v0, value },
                    Instruction::Return { src: v0 },
                ]
                .into_iter()
                .collect()
            }
            Behavior::ReturnEmptyList => match self.empty_list_form {
                EmptyListForm::Invoke => {
                    let method = dex.intern_method(COLLECTIONS, "emptyList", LIST_DESCRIPTOR, &[]);
                    [
                        Instruction::InvokeStatic {
                            method,
                            args: smallvec![],
                        },
                        Instruction::MoveResultObject { dst: v0 },
                        Instruction::ReturnObject { src: v0 },
                    ]
                    .into_iter()
                    .collect()
                }
                EmptyListForm::Field => {
                    let field = dex.intern_field(COLLECTIONS, "EMPTY_LIST", LIST_DESCRIPTOR);
                    [
                        Instruction::SgetObject { dst: v0, field },
                        Instruction::ReturnObject { src: v0 },
                    ]
                    .into_iter()
                    .collect()
                }
            },
        }
    }

    /// Empties the body of the method at `key` and installs the sequence for
    /// `behavior`.
    ///
    /// The frame becomes `ins_size + 1` registers; tries, handlers and debug
    /// info of the old body are dropped. On error the body is unchanged.
    pub fn rewrite(
        &self,
        dex: &mut DexFile,
        key: MethodKey,
        behavior: Behavior,
    ) -> Result<(), AssemblyError> {
        let ins_size = match dex.encoded_method(key) {
            None => return Err(AssemblyError::MissingMethod),
            Some(method) => method.code.as_ref().ok_or(AssemblyError::NoBody)?.ins_size,
        };
        let registers_size = ins_size
            .checked_add(1)
            .ok_or(AssemblyError::FrameOverflow { ins: ins_size })?;

        let sequence = self.canned_sequence(dex, behavior);

        let code = dex
            .encoded_method_mut(key)
            .and_then(|method| method.code.as_mut())
            .ok_or(AssemblyError::MissingMethod)?;

        let mut ir = match CodeIr::decode(code) {
            Ok(ir) => ir,
            Err(err) => {
                warn!("discarding undecodable body: {err}");
                CodeIr::new()
            }
        };
        debug!("removing {} instructions", ir.len());
        ir.clear();
        for instruction in sequence.iter() {
            ir.push(instruction.clone());
        }

        let mut staged = CodeItem {
            registers_size,
            ins_size,
            ..Default::default()
        };
        ir.assemble(&mut staged)?;
        *code = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::{ClassData, ClassDef, DebugInfo, EncodedMethod, MethodKind, TryItem};

    fn single_method(ret: &str, params: &[&str], code: Option<CodeItem>) -> (DexFile, MethodKey) {
        let mut dex = DexFile::new();
        let class_type = dex.intern_type("LFoo;");
        let method = dex.intern_method("LFoo;", "target", ret, params);
        dex.classes.push(ClassDef {
            class_type,
            access_flags: 0x1,
            superclass: None,
            interfaces: Vec::new(),
            source_file: None,
            annotations: None,
            class_data: Some(ClassData {
                direct_methods: vec![EncodedMethod {
                    method,
                    access_flags: 0x9,
                    code,
                }],
                ..Default::default()
            }),
            static_values: None,
        });
        let key = MethodKey {
            class: 0,
            kind: MethodKind::Direct,
            position: 0,
        };
        (dex, key)
    }

    fn busy_body(ins_size: u16) -> CodeItem {
        CodeItem {
            registers_size: 6,
            ins_size,
            outs_size: 1,
            // const/4 v1, #1; return v1
            insns: vec![0x1112, 0x010f],
            tries: vec![TryItem {
                start_addr: 0,
                insn_count: 1,
                handler: 0,
            }],
            handlers: vec![Default::default()],
            debug_info: Some(DebugInfo::default()),
        }
    }

    fn body(dex: &DexFile, key: MethodKey) -> &CodeItem {
        dex.encoded_method(key).unwrap().code.as_ref().unwrap()
    }

    #[test]
    fn return_false_replaces_everything() {
        let (mut dex, key) = single_method("Z", &[], Some(busy_body(0)));
        BodyRewriter::default()
            .rewrite(&mut dex, key, Behavior::ReturnFalse)
            .unwrap();

        let code = body(&dex, key);
        assert_eq!(code.insns, vec![0x0012, 0x000f]);
        assert_eq!(code.registers_size, 1);
        assert_eq!(code.outs_size, 0);
        assert!(code.tries.is_empty());
        assert!(code.handlers.is_empty());
        assert!(code.debug_info.is_none());
    }

    #[test]
    fn frame_is_ins_plus_one() {
        let (mut dex, key) = single_method("Z", &["I", "J"], Some(busy_body(4)));
        BodyRewriter::default()
            .rewrite(&mut dex, key, Behavior::ReturnTrue)
            .unwrap();
        let code = body(&dex, key);
        assert_eq!(code.registers_size, 5);
        assert_eq!(code.ins_size, 4);
        assert_eq!(code.insns, vec![0x1012, 0x000f]);
    }

    #[test]
    fn empty_list_interns_collections() {
        let (mut dex, key) = single_method("Ljava/util/List;", &["I"], Some(busy_body(2)));
        BodyRewriter::default()
            .rewrite(&mut dex, key, Behavior::ReturnEmptyList)
            .unwrap();

        let method = dex.methods.len() as u32 - 1;
        let code = body(&dex, key).clone();
        assert_eq!(code.insns, vec![0x0071, method as u16, 0x0000, 0x000c, 0x0011]);
        assert_eq!(code.registers_size, 3);

        let record = dex
            .method_records()
            .next()
            .map(|r| r.signature())
            .unwrap();
        assert_eq!(record, "LFoo;->target(I)Ljava/util/List;");
        assert!(dex.find_string("emptyList").is_some());
        assert!(dex.find_type("Ljava/util/Collections;").is_some());
    }

    #[test]
    fn field_form_reads_empty_list() {
        let (mut dex, key) = single_method("Ljava/util/List;", &[], Some(busy_body(1)));
        BodyRewriter::new(EmptyListForm::Field)
            .rewrite(&mut dex, key, Behavior::ReturnEmptyList)
            .unwrap();
        let code = body(&dex, key);
        assert_eq!(code.insns, vec![0x0062, 0x0000, 0x0011]);
        assert_eq!(dex.string(dex.fields[0].name), "EMPTY_LIST");
    }

    #[test]
    fn rewriting_twice_is_idempotent() {
        let (mut dex, key) = single_method("Ljava/util/List;", &[], Some(busy_body(1)));
        let rewriter = BodyRewriter::default();
        rewriter
            .rewrite(&mut dex, key, Behavior::ReturnEmptyList)
            .unwrap();
        let first = body(&dex, key).clone();
        let pools = (dex.strings.len(), dex.methods.len());
        rewriter
            .rewrite(&mut dex, key, Behavior::ReturnEmptyList)
            .unwrap();
        assert_eq!(body(&dex, key), &first);
        assert_eq!((dex.strings.len(), dex.methods.len()), pools);
    }

    #[test]
    fn bodiless_and_stale_targets_fail() {
        let (mut dex, key) = single_method("Z", &[], None);
        assert_eq!(
            BodyRewriter::default().rewrite(&mut dex, key, Behavior::ReturnTrue),
            Err(AssemblyError::NoBody)
        );
        let stale = MethodKey { position: 3, ..key };
        assert_eq!(
            BodyRewriter::default().rewrite(&mut dex, stale, Behavior::ReturnTrue),
            Err(AssemblyError::MissingMethod)
        );
    }

    #[test]
    fn full_frame_cannot_grow() {
        let mut code = busy_body(u16::MAX);
        code.registers_size = u16::MAX;
        let (mut dex, key) = single_method("Z", &[], Some(code.clone()));
        assert_eq!(
            BodyRewriter::default().rewrite(&mut dex, key, Behavior::ReturnTrue),
            Err(AssemblyError::FrameOverflow { ins: u16::MAX })
        );
        assert_eq!(body(&dex, key), &code);
    }
}
