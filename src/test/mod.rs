//! Class fixtures shared by the unit tests.

use crate::{
    code::ClassBuilder,
    runtime::{MemoryClassSource, ValueKind},
};

// A counter with a `count` field, a constructor zeroing it and `increment(int) -> int`
pub fn counter_class(name: &str) -> Vec<u8> {
    ClassBuilder::new(name)
        .constructor(&[], |asm| {
            asm.ldarg(0).ldc(0).stfld("count").ret();
        })
        .instance_method("increment", &[ValueKind::Int], ValueKind::Int, |asm| {
            asm.ldarg(0)
                .ldarg(0)
                .ldfld("count")
                .ldarg(1)
                .add()
                .stfld("count")
                .ldarg(0)
                .ldfld("count")
                .ret();
        })
        .build()
        .unwrap()
}

// A class whose static `run() -> int` constructs `target` and calls `increment(5)` on it.
// Pool entry 0 is the constructor of `target`.
pub fn caller_class(name: &str, target: &str) -> Vec<u8> {
    ClassBuilder::new(name)
        .static_method("run", &[], ValueKind::Int, |asm| {
            asm.newobj(target, &[])
                .stloc(0)
                .ldloc(0)
                .ldc(5)
                .callvirt(target, "increment", &[ValueKind::Int], ValueKind::Int)
                .ret();
        })
        .build()
        .unwrap()
}

// Helper function to create a source holding every image under its declared name
pub fn source_of(images: Vec<Vec<u8>>) -> MemoryClassSource {
    let mut source = MemoryClassSource::new();
    for image in images {
        source.add(image).unwrap();
    }
    source
}
