pub(crate) mod stage_workers;
