// 🛡️ Pipeline building blocks. server.rs wires them together per request.

pub mod traits;      // Component contracts
pub mod secrets;     // Memory hygiene (Credential)
pub mod job;         // Job ids and per-job directories
pub mod credentials; // SSH key staging and decryption
pub mod inventory;   // Ansible inventory generation
pub mod runner;      // Playbook process and merged output
pub mod relay;       // Line-by-line forwarding to the HTTP body
pub mod packager;    // Output directory -> zip
pub mod cleanup;     // Credential scrubbing
