//! Proof responses and their Starknet calldata form.

use serde::{Deserialize, Serialize};

use crate::circuit::Circuit;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofResponse {
    #[serde(alias = "full_proof_with_hints")]
    pub proof: Vec<String>,
    pub public_inputs: Vec<String>,
}

impl ProofResponse {
    pub fn new(proof: Vec<String>, public_inputs: Vec<String>) -> Self {
        Self {
            proof,
            public_inputs,
        }
    }

    /// `Array<felt252>` layout: length first.
    pub fn proof_calldata(&self) -> Vec<String> {
        length_prefixed(&self.proof)
    }

    pub fn public_inputs_calldata(&self) -> Vec<String> {
        length_prefixed(&self.public_inputs)
    }

    pub fn public_input(&self, circuit: Circuit, name: &str) -> Option<&str> {
        let position = circuit.public_inputs().iter().position(|n| *n == name)?;
        self.public_inputs.get(position).map(String::as_str)
    }
}

fn length_prefixed(values: &[String]) -> Vec<String> {
    let mut calldata = Vec::with_capacity(values.len() + 1);
    calldata.push(format!("0x{:x}", values.len()));
    calldata.extend(values.iter().cloned());
    calldata
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_full_proof_with_hints_alias() {
        let body = r#"{"full_proof_with_hints":["1","2"],"public_inputs":["3"]}"#;
        let response: ProofResponse = serde_json::from_str(body).expect("decode");
        assert_eq!(response.proof, vec!["1", "2"]);
        assert_eq!(response.public_inputs, vec!["3"]);
    }

    #[test]
    fn calldata_is_length_prefixed() {
        let response = ProofResponse::new(
            (0..10).map(|i| i.to_string()).collect(),
            vec!["7".to_string(), "8".to_string()],
        );
        let proof = response.proof_calldata();
        assert_eq!(proof[0], "0xa");
        assert_eq!(proof.len(), 11);
        assert_eq!(response.public_inputs_calldata(), vec!["0x2", "7", "8"]);
    }

    #[test]
    fn looks_up_public_inputs_by_name() {
        let response = ProofResponse::new(
            Vec::new(),
            vec!["11".into(), "22".into(), "33".into(), "44".into()],
        );
        assert_eq!(response.public_input(Circuit::Withdraw, "recipient"), Some("33"));
        assert_eq!(response.public_input(Circuit::Withdraw, "new_tick"), None);
    }
}
