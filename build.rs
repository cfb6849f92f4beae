//! Build script for heapwarden.
//!
//! Prints build-time notes about the enabled features and the target.

use std::env;

fn main() {
    // Re-run if features change
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_INTERPOSE");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_DEBUG");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_LOG");

    let interpose_enabled = env::var("CARGO_FEATURE_INTERPOSE").is_ok();
    let debug_enabled = env::var("CARGO_FEATURE_DEBUG").is_ok();

    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let is_release = profile == "release";

    // =========================================================================
    // Feature-specific diagnostics
    // =========================================================================

    // --- Interposition ---
    if interpose_enabled {
        emit_info("Interposition enabled: malloc/calloc/realloc/free are exported");
        emit_note("Preload the cdylib into the target process:");
        emit_note("  LD_PRELOAD=target/release/libheapwarden.so ./your_app");
        emit_note("");
        emit_note("Runtime switches (environment):");
        emit_note("  HEAPWARDEN_RECLAIM=0   keep leaked blocks for an external analyzer");
        emit_note("  HEAPWARDEN_GUARD=1     trailing guard word after every block");
        emit_note("  HEAPWARDEN_LEAK_EXIT=N exit with N when leaks are found");

        if !is_release {
            emit_warning("Interposing with a debug build; every allocation in the target pays for it");
        }
    }

    // --- Debug Features ---
    if debug_enabled {
        emit_info("Debug features enabled");
        emit_note("Memory poisoning is on by default:");
        emit_note("  • fresh blocks filled with 0xAB");
        emit_note("  • released blocks filled with 0xCD");
    }

    check_target();
}

// =============================================================================
// Diagnostic emission helpers
// =============================================================================

fn emit_info(msg: &str) {
    println!("cargo:warning=[heapwarden] ℹ️  {}", msg);
}

fn emit_note(msg: &str) {
    if msg.is_empty() {
        println!("cargo:warning=[heapwarden]");
    } else {
        println!("cargo:warning=[heapwarden]    {}", msg);
    }
}

fn emit_warning(msg: &str) {
    println!("cargo:warning=[heapwarden] ⚠️  {}", msg);
}

// =============================================================================
// Target checks
// =============================================================================

fn check_target() {
    let os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let env_name = env::var("CARGO_CFG_TARGET_ENV").unwrap_or_default();

    if os != "linux" {
        emit_warning(&format!("heapwarden targets Linux; building for `{}`", os));
        emit_note("Interposition relies on dlsym(RTLD_NEXT) and ELF .init_array.");
    } else if env_name == "musl" {
        emit_warning("musl target: statically linked programs ignore LD_PRELOAD");
    }
}
