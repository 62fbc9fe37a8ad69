pub(crate) mod stack_depth;
