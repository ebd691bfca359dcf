//! Smoke test for the emulated device
//!
//! Drives a full KMS session through the typed client against an in-memory
//! surface: enumerate, allocate, draw, flip, read the flip event back.

use drm_surface_shim::abi::*;
use drm_surface_shim::client::enumerate_devices;
use drm_surface_shim::registry::{CONNECTOR_ID, CRTC_ID, PLANE_ID};
use drm_surface_shim::surface::MemorySurface;
use drm_surface_shim::{logging, AtomicRequest, Card, Device, ShimConfig};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

fn main() {
    logging::init();

    println!("=== DRM Surface Shim Flip Test ===\n");

    let surface = MemorySurface::new(WIDTH, HEIGHT);
    let device = Device::with_surface(ShimConfig::from_env(), Box::new(surface.clone()));
    let card = Card::new(&device);

    // Test 1: Device nodes
    println!("--- Test 1: Device nodes ---");
    for node in enumerate_devices() {
        println!("  {} ({:?})", node.path, node.node_type);
    }

    // Test 2: Version
    println!("\n--- Test 2: DRM version ---");
    match card.version() {
        Ok(v) => println!(
            "  OK: {} {}.{}.{} ({})",
            v.name, v.major, v.minor, v.patchlevel, v.date
        ),
        Err(e) => {
            println!("  FAILED: {}", e);
            return;
        }
    }

    // Test 3: Resources and connector
    println!("\n--- Test 3: Resources ---");
    let mode = match card.resources().and_then(|_| card.connector(CONNECTOR_ID)) {
        Ok(conn) if !conn.modes.is_empty() => {
            let mode = conn.modes[0];
            println!(
                "  OK: connector {} {} ({}x{}mm)",
                conn.id,
                name_to_string(&mode.name),
                conn.mm_width,
                conn.mm_height
            );
            mode
        }
        Ok(_) => {
            println!("  FAILED: connector has no modes");
            return;
        }
        Err(e) => {
            println!("  FAILED: {}", e);
            return;
        }
    };

    // Test 4: Dumb buffers
    println!("\n--- Test 4: Dumb buffers ---");
    let mut fbs = Vec::new();
    for (i, color) in [0xff20_4080u32, 0xffc0_3020].into_iter().enumerate() {
        let size = WIDTH / (i as u32 + 1);
        let created = card.create_dumb(size, size.min(HEIGHT), 32).and_then(|buf| {
            let offset = card.map_dumb(buf.handle)?;
            let pixels = (buf.size / 4) as usize;
            unsafe { std::slice::from_raw_parts_mut(offset as usize as *mut u32, pixels) }.fill(color);
            let fb = card.add_framebuffer(buf.handle, size, size.min(HEIGHT), fourcc::XRGB8888, buf.pitch)?;
            Ok((buf, fb))
        });
        match created {
            Ok((buf, fb)) => {
                println!("  OK: buffer {} pitch={} size={} -> fb {}", buf.handle, buf.pitch, buf.size, fb);
                fbs.push(fb);
            }
            Err(e) => {
                println!("  FAILED: {}", e);
                return;
            }
        }
    }

    // Test 5: Modeset and flip
    println!("\n--- Test 5: Modeset and flip ---");
    if let Err(e) = card.set_crtc(CRTC_ID, fbs[0], 0, 0, &[CONNECTOR_ID], Some(&mode)) {
        println!("  FAILED: SETCRTC: {}", e);
        return;
    }
    if let Err(e) = device.set_window_geometry(fbs[1], 40, 40, WIDTH / 2, HEIGHT / 2) {
        println!("  FAILED: window geometry: {}", e);
    }
    if let Err(e) = device.set_window_z(fbs[1], 5) {
        println!("  FAILED: window z: {}", e);
    }
    match card.page_flip(CRTC_ID, fbs[0], DRM_MODE_PAGE_FLIP_EVENT, 0x1234) {
        Ok(()) => println!(
            "  OK: flipped, pixel(0,0)=0x{:08x} pixel(50,50)=0x{:08x}",
            surface.pixel(0, 0).unwrap_or(0),
            surface.pixel(50, 50).unwrap_or(0)
        ),
        Err(e) => println!("  FAILED: {}", e),
    }

    // Test 6: Flip event
    println!("\n--- Test 6: Flip event ---");
    let mut buf = [0u8; 64];
    match device.read_events(&mut buf) {
        Ok(n) => {
            let event = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const DrmEventVblank) };
            println!(
                "  OK: {} bytes, type={} seq={} user_data=0x{:x}",
                n, event.base.type_, event.sequence, event.user_data
            );
        }
        Err(e) => println!("  FAILED: {}", e),
    }

    // Test 7: Atomic and properties
    println!("\n--- Test 7: Atomic commit ---");
    let mut atomic = AtomicRequest::new();
    atomic.add_property(PLANE_ID, 3, u64::from(CRTC_ID));
    let result = card
        .set_client_cap(DRM_CLIENT_CAP_ATOMIC, 1)
        .and_then(|_| atomic.commit(&card, DRM_MODE_ATOMIC_TEST_ONLY, 0))
        .and_then(|_| card.object_properties(PLANE_ID, DRM_MODE_OBJECT_PLANE));
    match result {
        Ok(props) => println!("  OK: plane properties {:?}", props),
        Err(e) => println!("  FAILED: {}", e),
    }

    // Test 8: Blob
    println!("\n--- Test 8: Property blob ---");
    let payload = b"mode blob payload";
    match card
        .create_property_blob(payload)
        .and_then(|id| card.property_blob(id).map(|data| (id, data)))
    {
        Ok((id, data)) if data == payload => {
            println!("  OK: blob {} round trip", id);
            let _ = card.destroy_property_blob(id);
        }
        Ok((id, _)) => println!("  FAILED: blob {} data mismatch", id),
        Err(e) => println!("  FAILED: {}", e),
    }

    let stats = device.stats();
    println!("\n--- Statistics ---");
    println!("  Current framebuffer: {}", device.current_framebuffer());
    println!("  Flips: {}", stats.flips);
    println!("  Windows drawn: {}", stats.windows_drawn);
    println!("  Pixels copied: {}", stats.pixels_copied);
    println!("  Last composite: {:?}", stats.last_composite);

    device.reset();
    println!("\n=== All tests complete! ===");
}
