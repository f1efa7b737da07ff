mod func_builder;
mod module_builder;

pub use func_builder::FunctionBuilder;
pub use module_builder::ModuleBuilder;

pub mod test_util {
    use super::*;

    use crate::{
        ir_writer::FuncWriter,
        module::{FuncRef, Module},
        Linkage, Signature, Type,
    };

    /// Module builder for tests. Functions built through
    /// [`Self::func_builder`] are named `test_func`, later ones get a numeric
    /// suffix.
    #[derive(Default)]
    pub struct TestModuleBuilder {
        module_builder: ModuleBuilder,
        func_num: usize,
    }

    impl TestModuleBuilder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn func_builder(&mut self, args: &[Type], ret_ty: &Type) -> FunctionBuilder<'_> {
            let name = match self.func_num {
                0 => "test_func".to_string(),
                n => format!("test_func{n}"),
            };
            self.func_num += 1;
            let sig = Signature::new(&name, Linkage::Public, args, ret_ty.clone());
            let func_ref = self.module_builder.declare_function(sig);
            if self.module_builder.module.entry.is_none() {
                self.module_builder.set_entry(func_ref);
            }
            self.module_builder.func_builder(func_ref)
        }

        pub fn declare_function(&mut self, sig: Signature) -> FuncRef {
            self.module_builder.declare_function(sig)
        }

        pub fn module_builder(&mut self) -> &mut ModuleBuilder {
            &mut self.module_builder
        }

        pub fn build(self) -> Module {
            self.module_builder.build()
        }
    }

    pub fn dump_func(module: &Module, func: FuncRef) -> String {
        FuncWriter::new(module, func).dump_string()
    }
}
