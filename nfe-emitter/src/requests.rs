//! Messages sent to the authority, before SOAP framing.

use rand::{CryptoRng, Rng, RngCore};
use std::fmt;

use crate::{
    access_key::AccessKey,
    constants::{LAYOUT_VERSION, NFE_NAMESPACE},
    signature::SignedInvoice,
    types::{Environment, ReceiptNumber, Uf},
    xml::Element,
};

const MAX_BATCH_ID: u64 = 999_999_999_999_999;

/// `idLote`: up to 15 digits, chosen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchId(u64);

impl BatchId {
    pub fn random(rng: &mut (impl CryptoRng + RngCore)) -> Self {
        Self(rng.gen_range(1..=MAX_BATCH_ID))
    }

    pub fn new(id: u64) -> Option<Self> {
        (1..=MAX_BATCH_ID).contains(&id).then_some(Self(id))
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `enviNFe` carrying one signed document. The document is embedded as
/// serialized at signing; it is never re-parsed or re-written.
///
/// With `synchronous` set the authority may answer with the protocol right
/// away (`104`) instead of a receipt (`103`).
pub fn authorization_request(
    signed: &SignedInvoice,
    batch_id: BatchId,
    synchronous: bool,
) -> String {
    format!(
        r#"<enviNFe xmlns="{NFE_NAMESPACE}" versao="{LAYOUT_VERSION}"><idLote>{batch_id}</idLote><indSinc>{}</indSinc>{}</enviNFe>"#,
        u8::from(synchronous),
        signed.xml()
    )
}

/// `consReciNFe`: result of a batch by receipt number.
pub fn receipt_query(environment: Environment, receipt: &ReceiptNumber) -> String {
    message("consReciNFe")
        .with_child(Element::leaf("tpAmb", environment.code().to_string()))
        .with_child(Element::leaf("nRec", receipt.as_str()))
        .to_xml()
}

/// `consSitNFe`: current situation of a document by access key.
pub fn protocol_query(environment: Environment, access_key: &AccessKey) -> String {
    message("consSitNFe")
        .with_child(Element::leaf("tpAmb", environment.code().to_string()))
        .with_child(Element::leaf("xServ", "CONSULTAR"))
        .with_child(Element::leaf("chNFe", access_key.as_str()))
        .to_xml()
}

/// `consStatServ`: availability of the authorization service for a state.
pub fn status_query(environment: Environment, uf: Uf) -> String {
    message("consStatServ")
        .with_child(Element::leaf("tpAmb", environment.code().to_string()))
        .with_child(Element::leaf("cUF", uf.ibge_code().to_string()))
        .with_child(Element::leaf("xServ", "STATUS"))
        .to_xml()
}

fn message(name: &str) -> Element {
    Element::new(name)
        .with_attribute("xmlns", NFE_NAMESPACE)
        .with_attribute("versao", LAYOUT_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{identity::tests::test_identity, SignatureAlgorithm},
        document::tests::build_test_invoice,
        signature::SignatureEngine,
    };
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn batch_embeds_signed_document_verbatim() {
        let signed = SignatureEngine::new(SignatureAlgorithm::RsaSha1)
            .sign(&build_test_invoice(Environment::Homologation), &test_identity())
            .unwrap();
        let batch = authorization_request(&signed, BatchId::new(7).unwrap(), true);

        assert!(batch.starts_with(
            r#"<enviNFe xmlns="http://www.portalfiscal.inf.br/nfe" versao="4.00"><idLote>7</idLote><indSinc>1</indSinc><NFe "#
        ));
        assert!(batch.contains(signed.xml()));

        let parsed = Element::parse(&batch).unwrap();
        assert_eq!(parsed.child_text("indSinc").unwrap(), "1");
        assert!(parsed.child("NFe").is_some());
    }

    #[test]
    fn batch_ids_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let id = BatchId::random(&mut rng);
            assert!(id.0 >= 1 && id.0 <= MAX_BATCH_ID);
        }
        assert!(BatchId::new(0).is_none());
        assert!(BatchId::new(MAX_BATCH_ID + 1).is_none());
    }

    #[test]
    fn queries_have_expected_shape() {
        assert_eq!(
            receipt_query(Environment::Homologation, &ReceiptNumber::new("291000012345678")),
            r#"<consReciNFe xmlns="http://www.portalfiscal.inf.br/nfe" versao="4.00"><tpAmb>2</tpAmb><nRec>291000012345678</nRec></consReciNFe>"#
        );

        let key: AccessKey = "29240512345678000195550010000000421123456789".parse().unwrap();
        assert_eq!(
            protocol_query(Environment::Production, &key),
            r#"<consSitNFe xmlns="http://www.portalfiscal.inf.br/nfe" versao="4.00"><tpAmb>1</tpAmb><xServ>CONSULTAR</xServ><chNFe>29240512345678000195550010000000421123456789</chNFe></consSitNFe>"#
        );

        assert_eq!(
            status_query(Environment::Homologation, Uf::BA),
            r#"<consStatServ xmlns="http://www.portalfiscal.inf.br/nfe" versao="4.00"><tpAmb>2</tpAmb><cUF>29</cUF><xServ>STATUS</xServ></consStatServ>"#
        );
    }
}
