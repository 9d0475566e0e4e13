//! Accelerator device inventory.
//!
//! Answers one question: how many accelerator devices are physically
//! visible on this node. The count feeds proxy election in `topology`.

/// Number of accelerator devices visible to this process.
///
/// Enumerates wgpu adapters and counts everything that is an actual
/// device (discrete, integrated, or virtual GPU). Software rasterizers
/// and CPU fallback adapters are excluded: electing a proxy for one of
/// those would defeat the purpose of funnelling work onto accelerators.
///
/// Returns 0 on a node with no usable device. `topology::build` treats
/// that as a fatal misconfiguration for any node expected to own work.
pub fn visible_device_count() -> usize {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    instance
        .enumerate_adapters(wgpu::Backends::all())
        .iter()
        .filter(|adapter| {
            matches!(
                adapter.get_info().device_type,
                wgpu::DeviceType::DiscreteGpu
                    | wgpu::DeviceType::IntegratedGpu
                    | wgpu::DeviceType::VirtualGpu
            )
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_does_not_panic() {
        // Headless CI has no adapters; the count just comes back 0.
        let n = visible_device_count();
        assert!(n < 1024, "implausible device count {n}");
    }
}
