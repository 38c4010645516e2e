//! Execution of free patches.
//!
//! Every action builds a new instruction sequence for the bodies it touches and swaps it in
//! as a whole; a body is never edited instruction by instruction in place.

use std::collections::BTreeSet;

use crate::{
    assembly::{opcodes, Instruction, Operand},
    image::{ExceptionHandler, Image, MethodImport, Token},
    module::Module,
    patch::{
        FreePatch, InstructionPattern, MethodMatcher, PatchAction, PatchRecord, PatchRegistry,
        PatchResult, PatchScope,
    },
    Result,
};

/// Applies the patches of a registry to modules.
///
/// The engine does not check [`Module::allow_patches`]; callers decide which modules it
/// sees.
pub struct PatchEngine<'a> {
    registry: &'a PatchRegistry,
}

impl<'a> PatchEngine<'a> {
    /// Create an engine over `registry`.
    #[must_use]
    pub fn new(registry: &'a PatchRegistry) -> Self {
        PatchEngine { registry }
    }

    /// Apply every patch targeting `module`, in registration order.
    ///
    /// The module is marked modified if any patch changed it.
    ///
    /// # Errors
    /// Returns an error if the module was already serialized or a replacement method cannot
    /// be imported.
    pub fn apply_all(&self, module: &mut Module) -> Result<Vec<PatchRecord>> {
        let name = module.name().to_string();
        let mut records = Vec::new();

        for patch in self.registry.for_module(&name) {
            let result = apply(module.image_mut()?, patch)?;
            if result.is_applied() {
                module.mark_modified();
            }

            records.push(PatchRecord {
                patch: patch.name.clone(),
                module: name.clone(),
                result,
            });
        }

        Ok(records)
    }
}

/// Apply a single patch to `image`.
///
/// # Errors
/// Returns an error if a replacement method cannot be imported.
pub fn apply(image: &mut Image, patch: &FreePatch) -> Result<PatchResult> {
    let methods = match &patch.scope {
        PatchScope::Method {
            type_name,
            method_name,
        } => {
            let Some(index) = image.find_method(type_name, method_name) else {
                return Ok(PatchResult::NotApplicable(format!(
                    "{type_name}::{method_name} not found"
                )));
            };
            if image.methods[index].body.is_none() {
                return Ok(PatchResult::NotApplicable(format!(
                    "{type_name}::{method_name} has no body"
                )));
            }
            vec![index]
        }
        PatchScope::Module => (0..image.methods.len()).collect(),
    };

    let changes = match &patch.action {
        PatchAction::RedirectCall {
            target,
            replacement,
        } => redirect_calls(image, &methods, target, replacement)?,
        PatchAction::StripToReturn { at } => strip_to_return(image, &methods, at),
        PatchAction::RenameType { from, to } => rename_type(image, &methods, from, to),
    };

    Ok(if changes == 0 {
        PatchResult::Unchanged
    } else {
        PatchResult::Applied { changes }
    })
}

fn redirect_calls(
    image: &mut Image,
    methods: &[usize],
    target: &MethodMatcher,
    replacement: &MethodImport,
) -> Result<usize> {
    let mut replacement_token: Option<Token> = None;
    let mut changes = 0;

    for &index in methods {
        let Some(body) = image.methods[index].body.as_ref() else {
            continue;
        };

        let hits: Vec<bool> = body
            .instructions
            .iter()
            .map(|i| i.token().is_some_and(|token| target.matches(image, token)))
            .collect();
        if !hits.contains(&true) {
            continue;
        }

        // Imported lazily so that a module without call sites keeps its tables untouched
        let token = match replacement_token {
            Some(token) => token,
            None => *replacement_token.insert(image.import_method(replacement)?),
        };

        let Some(body) = image.methods[index].body.as_mut() else {
            continue;
        };
        let rewritten: Vec<Instruction> = body
            .instructions
            .iter()
            .zip(&hits)
            .map(|(instruction, hit)| {
                if *hit && instruction.token() != Some(token) {
                    changes += 1;
                    Instruction {
                        operand: Operand::Token(token),
                        ..instruction.clone()
                    }
                } else {
                    instruction.clone()
                }
            })
            .collect();
        body.instructions = rewritten;
    }

    Ok(changes)
}

fn strip_to_return(image: &mut Image, methods: &[usize], at: &InstructionPattern) -> usize {
    let mut changes = 0;

    for &index in methods {
        let Some(body) = image.methods[index].body.as_ref() else {
            continue;
        };
        let Some(cut) = body
            .instructions
            .iter()
            .position(|instruction| at.matches(image, instruction))
        else {
            continue;
        };

        let cut_instruction = &body.instructions[cut];
        let is_ret = cut_instruction.prefix == 0 && cut_instruction.opcode == opcodes::RET;
        if is_ret && cut + 1 == body.instructions.len() {
            continue;
        }

        let mut stripped: Vec<Instruction> = body.instructions[..cut]
            .iter()
            .map(|instruction| clamp_targets(instruction, cut))
            .collect();
        stripped.push(Instruction {
            sequence_point: cut_instruction.sequence_point.clone(),
            ..Instruction::ret()
        });

        let handlers: Vec<ExceptionHandler> = body
            .exception_handlers
            .iter()
            .filter(|handler| !handler.extends_past(cut))
            .cloned()
            .collect();

        // A leave outside every remaining clause has no region to exit
        for (position, instruction) in stripped.iter_mut().enumerate() {
            let branch = match instruction.opcode {
                opcodes::LEAVE => opcodes::BR,
                opcodes::LEAVE_S => opcodes::BR_S,
                _ => continue,
            };
            if instruction.prefix == 0 && !handlers.iter().any(|h| h.covers(position)) {
                instruction.opcode = branch;
            }
        }

        if let Some(body) = image.methods[index].body.as_mut() {
            body.instructions = stripped;
            body.exception_handlers = handlers;
            changes += 1;
        }
    }

    changes
}

// Branches into the removed tail land on the inserted `ret`
fn clamp_targets(instruction: &Instruction, cut: usize) -> Instruction {
    let operand = match &instruction.operand {
        Operand::Target(target) => Operand::Target((*target).min(cut)),
        Operand::Switch(targets) => {
            Operand::Switch(targets.iter().map(|target| (*target).min(cut)).collect())
        }
        other => other.clone(),
    };

    Instruction {
        operand,
        ..instruction.clone()
    }
}

fn rename_type(image: &mut Image, methods: &[usize], from: &str, to: &str) -> usize {
    let new_name = to.rsplit(['.', '/']).next().unwrap_or(to);

    let mut renamed_refs = BTreeSet::new();
    let mut renamed_defs = BTreeSet::new();
    let mut changes = 0;

    for &index in methods {
        let Some(body) = image.methods[index].body.as_ref() else {
            continue;
        };

        for token in body.instructions.iter().filter_map(Instruction::token) {
            match referenced_type(image, token) {
                Some(TypeIndex::Ref(type_ref)) => {
                    if image.type_ref_full_name(type_ref).as_deref() == Some(from)
                        && image.type_refs[type_ref].name != new_name
                    {
                        renamed_refs.insert(type_ref);
                        changes += 1;
                    }
                }
                Some(TypeIndex::Def(type_def)) => {
                    if image.type_def_full_name(type_def).as_deref() == Some(from)
                        && image.type_defs[type_def].name != new_name
                    {
                        renamed_defs.insert(type_def);
                        changes += 1;
                    }
                }
                None => {}
            }
        }
    }

    for type_ref in renamed_refs {
        image.type_refs[type_ref].name = new_name.to_string();
    }
    for type_def in renamed_defs {
        image.type_defs[type_def].name = new_name.to_string();
    }

    changes
}

enum TypeIndex {
    Ref(usize),
    Def(usize),
}

/// The type an instruction token names or is a member of.
fn referenced_type(image: &Image, token: Token) -> Option<TypeIndex> {
    let parent = match token.table() {
        Token::MEMBER_REF => image.member_refs.get(token.index()?)?.parent,
        _ => token,
    };

    match parent.table() {
        Token::TYPE_REF => parent.index().map(TypeIndex::Ref),
        Token::TYPE_DEF => parent.index().map(TypeIndex::Def),
        Token::METHOD_DEF => image.method_owner(parent.index()?).map(TypeIndex::Def),
        _ => None,
    }
}
