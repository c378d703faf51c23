fn main() {
    // ESP-IDF environment is only needed for espidf targets (xtensa and riscv).
    // Host builds run the gateway core against the simulated transceiver.
    if let Ok(target) = std::env::var("TARGET") {
        if target.ends_with("-espidf") {
            embuild::espidf::sysenv::output();
        }
    }
}
