mod build;
mod host;
mod images;
mod layout;

pub(crate) use build::{shape_build, shape_list, shape_plan, shape_show};
pub(crate) use host::{
    interface_list, interface_show, setup_list, setup_show, setup_start, setup_stop, unit_start,
    unit_stop,
};
pub(crate) use images::{image_gc, image_list, image_remove, image_verify};
