use containers::{Block, BlockBody, BlockHeader, Receipt, receipts_root};

use super::error::ValidationError;
use crate::types::BlockValidator;

/// Structural checks only: numbering, hash links and the roots a header
/// commits to. Consensus rules and execution belong to the node embedding
/// the sync engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralValidator;

impl BlockValidator for StructuralValidator {
    fn validate_header_chain(
        &self,
        parent: Option<&BlockHeader>,
        headers: &[BlockHeader],
    ) -> Result<(), ValidationError> {
        let mut previous = parent;
        for header in headers {
            if let Some(previous) = previous {
                if header.number != previous.number + 1 {
                    return Err(ValidationError::UnexpectedNumber {
                        expected: previous.number + 1,
                        actual: header.number,
                    });
                }
                if header.parent_hash != previous.hash() {
                    return Err(ValidationError::BrokenLink {
                        number: header.number,
                    });
                }
            }
            previous = Some(header);
        }
        Ok(())
    }

    fn validate_body(
        &self,
        header: &BlockHeader,
        body: &BlockBody,
    ) -> Result<(), ValidationError> {
        if body.transactions_root() != header.transactions_root {
            return Err(ValidationError::TransactionsRoot {
                number: header.number,
            });
        }
        Ok(())
    }

    fn validate_receipts(
        &self,
        header: &BlockHeader,
        receipts: &[Receipt],
    ) -> Result<(), ValidationError> {
        if receipts_root(receipts) != header.receipts_root {
            return Err(ValidationError::ReceiptsRoot {
                number: header.number,
            });
        }
        Ok(())
    }

    fn execute_block(&self, block: &Block) -> Result<(), ValidationError> {
        self.validate_body(&block.header, &block.body)
            .map_err(|error| ValidationError::Execution {
                number: block.number(),
                reason: error.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use containers::Bytes32;

    use super::*;

    fn chain(length: u64) -> Vec<BlockHeader> {
        let mut headers: Vec<BlockHeader> = Vec::new();
        for number in 0..length {
            let parent_hash = headers.last().map_or(Bytes32::ZERO, BlockHeader::hash);
            headers.push(BlockHeader {
                number,
                parent_hash,
                ..Default::default()
            });
        }
        headers
    }

    #[test]
    fn test_linked_chain_passes() {
        let headers = chain(5);
        StructuralValidator
            .validate_header_chain(Some(&headers[0]), &headers[1..])
            .unwrap();
    }

    #[test]
    fn test_broken_link_detected() {
        let mut headers = chain(5);
        headers[3].parent_hash = Bytes32::ZERO;
        assert_eq!(
            StructuralValidator.validate_header_chain(None, &headers),
            Err(ValidationError::BrokenLink { number: 3 })
        );
    }

    #[test]
    fn test_body_root_checked() {
        let body = BlockBody::new(vec![vec![1, 2, 3]]);
        let header = BlockHeader {
            transactions_root: body.transactions_root(),
            ..Default::default()
        };
        StructuralValidator.validate_body(&header, &body).unwrap();
        assert!(
            StructuralValidator
                .validate_body(&header, &BlockBody::default())
                .is_err()
        );
    }
}
