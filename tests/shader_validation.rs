//! Parses and validates every WGSL kernel the crate embeds, so shader
//! regressions surface in `cargo test` instead of at device creation.

use naga::valid::{Capabilities, ValidationFlags, Validator};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn validate(name: &str, source: &str) {
    init_logs();
    log::debug!("validating {name}");
    let module = naga::front::wgsl::parse_str(source)
        .unwrap_or_else(|err| panic!("{name}: parse failed:\n{}", err.emit_to_string(source)));
    Validator::new(ValidationFlags::all(), Capabilities::default())
        .validate(&module)
        .unwrap_or_else(|err| panic!("{name}: validation failed: {err:?}"));
}

macro_rules! shader_test {
    ($test:ident, $file:literal) => {
        #[test]
        fn $test() {
            validate($file, include_str!(concat!("../src/shaders/", $file)));
        }
    };
}

shader_test!(init_queues_is_valid, "init_queues.wgsl");
shader_test!(primitive_filter_is_valid, "primitive_filter.wgsl");
shader_test!(instance_cull_is_valid, "instance_cull.wgsl");
shader_test!(init_cull_args_is_valid, "init_cull_args.wgsl");
shader_test!(node_cluster_cull_is_valid, "node_cluster_cull.wgsl");
shader_test!(persistent_cull_is_valid, "persistent_cull.wgsl");
shader_test!(clamp_indirect_args_is_valid, "clamp_indirect_args.wgsl");
shader_test!(raster_binning_is_valid, "raster_binning.wgsl");
shader_test!(sw_raster_is_valid, "sw_raster.wgsl");
shader_test!(hw_raster_is_valid, "hw_raster.wgsl");
shader_test!(hzb_build_is_valid, "hzb_build.wgsl");

#[test]
fn cull_kernels_expose_expected_entry_points() {
    init_logs();
    let expect = |file: &str, source: &str, entries: &[&str]| {
        let module = naga::front::wgsl::parse_str(source).unwrap();
        for entry in entries {
            assert!(
                module.entry_points.iter().any(|ep| ep.name == *entry),
                "{file}: missing entry point {entry}"
            );
        }
    };

    expect(
        "node_cluster_cull.wgsl",
        include_str!("../src/shaders/node_cluster_cull.wgsl"),
        &["node_cull", "cluster_cull"],
    );
    expect(
        "raster_binning.wgsl",
        include_str!("../src/shaders/raster_binning.wgsl"),
        &["bin_count", "bin_reserve", "bin_scatter"],
    );
    expect(
        "hw_raster.wgsl",
        include_str!("../src/shaders/hw_raster.wgsl"),
        &["hw_vertex", "hw_fragment"],
    );
}
