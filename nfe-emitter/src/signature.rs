//! Enveloped XML-DSig over `infNFe`.
//!
//! The reference points at `#NFe<key>`, is transformed with
//! enveloped-signature plus Canonical XML 1.0 and the `Signature` element is
//! appended as the last child of `NFe`. Canonicalization is done by
//! [`Element::to_canonical`], the same writer that produces the transmitted
//! bytes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, instrument};

use crate::{
    access_key::AccessKey,
    constants::{C14N_ALGORITHM, ENVELOPED_SIGNATURE_TRANSFORM, XMLDSIG_NAMESPACE},
    crypto::{public_key_from_certificate, CryptoError, SignatureAlgorithm, SigningIdentity},
    document::UnsignedInvoice,
    money::Amount,
    types::{Environment, InvoiceSeries},
    xml::Element,
};

/// A signed document. Immutable: the serialized form is fixed at signing and
/// there is no way to reach the signed tree mutably.
#[derive(Debug, Clone)]
pub struct SignedInvoice {
    access_key: AccessKey,
    series: InvoiceSeries,
    environment: Environment,
    total: Amount,
    algorithm: SignatureAlgorithm,
    digest_value: String,
    xml: String,
}

impl SignedInvoice {
    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn series(&self) -> InvoiceSeries {
        self.series
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn total(&self) -> Amount {
        self.total
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// Base64 digest of `infNFe`. The authority echoes it as `digVal`.
    pub fn digest_value(&self) -> &str {
        &self.digest_value
    }

    /// The signed `NFe` element, without an XML declaration, ready to be
    /// wrapped in a batch.
    pub fn xml(&self) -> &str {
        &self.xml
    }

    /// Load a document signed earlier, e.g. to resume polling a receipt. The
    /// signature is verified against the embedded certificate first.
    pub fn from_xml(xml: &str) -> Result<Self, CryptoError> {
        let malformed = |reason: &str| CryptoError::MalformedSignature(reason.to_string());

        let verified = verify_signed_xml(xml, None)?;
        let document =
            Element::parse(xml).map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
        if document.local_name() != "NFe" {
            return Err(malformed("root element is not NFe"));
        }

        let environment = document
            .find("tpAmb")
            .and_then(|element| Environment::from_code(element.text().trim()))
            .ok_or_else(|| malformed("missing or invalid tpAmb"))?;
        let total: Amount = document
            .find("vNF")
            .and_then(|element| element.text().trim().parse().ok())
            .ok_or_else(|| malformed("missing or invalid vNF"))?;

        let key = &verified.access_key;
        let series = key
            .series()
            .parse::<u32>()
            .ok()
            .zip(key.number().parse::<u64>().ok())
            .and_then(|(series, number)| InvoiceSeries::new(series, number).ok())
            .ok_or_else(|| malformed("access key carries an invalid series or number"))?;

        Ok(Self {
            access_key: verified.access_key,
            series,
            environment,
            total,
            algorithm: verified.algorithm,
            digest_value: verified.digest_value,
            xml: document.to_xml(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SignatureEngine {
    algorithm: SignatureAlgorithm,
}

impl SignatureEngine {
    pub fn new(algorithm: SignatureAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// Sign `invoice` with `identity`. The unsigned invoice is left as is.
    #[instrument(skip_all, err(Debug), fields(access_key = %invoice.access_key(), algorithm = %self.algorithm))]
    pub fn sign(
        &self,
        invoice: &UnsignedInvoice,
        identity: &SigningIdentity,
    ) -> Result<SignedInvoice, CryptoError> {
        let root = invoice.root();
        let info = root
            .child("infNFe")
            .ok_or_else(|| CryptoError::MalformedSignature("document has no infNFe".into()))?;
        let id = info
            .attribute("Id")
            .ok_or_else(|| CryptoError::MalformedSignature("infNFe has no Id".into()))?;

        let canonical_info = info.to_canonical(root.attribute("xmlns"));
        let digest_value = STANDARD.encode(self.algorithm.digest(canonical_info.as_bytes()));

        let signed_info = signed_info(self.algorithm, id, &digest_value);
        let canonical_signed_info = signed_info.to_canonical(Some(XMLDSIG_NAMESPACE));
        let signature_value = STANDARD.encode(
            self.algorithm
                .sign(identity.private_key(), canonical_signed_info.as_bytes())?,
        );

        let signature = Element::new("Signature")
            .with_attribute("xmlns", XMLDSIG_NAMESPACE)
            .with_child(signed_info)
            .with_child(Element::leaf("SignatureValue", signature_value))
            .with_child(Element::new("KeyInfo").with_child(
                Element::new("X509Data").with_child(Element::leaf(
                    "X509Certificate",
                    identity.certificate_base64(),
                )),
            ));

        let xml = root.clone().with_child(signature).to_xml();
        debug!("Document signed");

        Ok(SignedInvoice {
            access_key: invoice.access_key().clone(),
            series: invoice.series(),
            environment: invoice.environment(),
            total: invoice.total(),
            algorithm: self.algorithm,
            digest_value,
            xml,
        })
    }
}

fn signed_info(algorithm: SignatureAlgorithm, id: &str, digest_value: &str) -> Element {
    Element::new("SignedInfo")
        .with_child(Element::new("CanonicalizationMethod").with_attribute("Algorithm", C14N_ALGORITHM))
        .with_child(
            Element::new("SignatureMethod").with_attribute("Algorithm", algorithm.signature_method()),
        )
        .with_child(
            Element::new("Reference")
                .with_attribute("URI", format!("#{id}"))
                .with_child(
                    Element::new("Transforms")
                        .with_child(
                            Element::new("Transform")
                                .with_attribute("Algorithm", ENVELOPED_SIGNATURE_TRANSFORM),
                        )
                        .with_child(Element::new("Transform").with_attribute("Algorithm", C14N_ALGORITHM)),
                )
                .with_child(
                    Element::new("DigestMethod").with_attribute("Algorithm", algorithm.digest_method()),
                )
                .with_child(Element::leaf("DigestValue", digest_value)),
        )
}

/// Result of a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedSignature {
    pub access_key: AccessKey,
    pub algorithm: SignatureAlgorithm,
    pub digest_value: String,
    pub certificate_der: Vec<u8>,
}

/// Verify the signature of the first `NFe` found in `xml`, which may be a
/// bare `NFe`, a batch or an `nfeProc`. The signer's certificate is taken
/// from `KeyInfo` unless `certificate` is given.
pub fn verify_signed_xml(
    xml: &str,
    certificate: Option<&[u8]>,
) -> Result<VerifiedSignature, CryptoError> {
    let malformed = |reason: &str| CryptoError::MalformedSignature(reason.to_string());

    let document = Element::parse(xml).map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
    let (nfe, nfe_namespace) =
        find_with_namespace(&document, "NFe", None).ok_or_else(|| malformed("no NFe element"))?;

    let info = nfe.child("infNFe").ok_or_else(|| malformed("no infNFe element"))?;
    let id = info.attribute("Id").ok_or_else(|| malformed("infNFe has no Id"))?;
    let access_key: AccessKey = id
        .parse()
        .map_err(|_| malformed("infNFe Id is not an access key"))?;

    let signature = nfe.child("Signature").ok_or_else(|| malformed("no Signature element"))?;
    let signature_namespace = signature.attribute("xmlns").or(nfe_namespace);
    let signed_info = signature
        .child("SignedInfo")
        .ok_or_else(|| malformed("no SignedInfo element"))?;

    let canonicalization = signed_info
        .child("CanonicalizationMethod")
        .and_then(|method| method.attribute("Algorithm"));
    if canonicalization != Some(C14N_ALGORITHM) {
        return Err(CryptoError::UnsupportedAlgorithm(format!(
            "canonicalization {canonicalization:?}"
        )));
    }

    let reference = signed_info.child("Reference").ok_or_else(|| malformed("no Reference"))?;
    if reference.attribute("URI") != Some(format!("#{id}").as_str()) {
        return Err(malformed("Reference does not point at infNFe"));
    }
    let transforms: Vec<&str> = reference
        .child("Transforms")
        .map(|transforms| {
            transforms
                .children_named("Transform")
                .filter_map(|transform| transform.attribute("Algorithm"))
                .collect()
        })
        .unwrap_or_default();
    if transforms != [ENVELOPED_SIGNATURE_TRANSFORM, C14N_ALGORITHM] {
        return Err(CryptoError::UnsupportedAlgorithm(format!(
            "transforms {transforms:?}"
        )));
    }

    let algorithm = SignatureAlgorithm::from_methods(
        signed_info
            .child("SignatureMethod")
            .and_then(|method| method.attribute("Algorithm"))
            .unwrap_or_default(),
        reference
            .child("DigestMethod")
            .and_then(|method| method.attribute("Algorithm"))
            .unwrap_or_default(),
    )?;

    let declared_digest = compact(&reference.child_text("DigestValue").unwrap_or_default());
    let actual_digest =
        STANDARD.encode(algorithm.digest(info.to_canonical(nfe_namespace).as_bytes()));
    if declared_digest != actual_digest {
        return Err(CryptoError::DigestMismatch);
    }

    let certificate_der = match certificate {
        Some(der) => der.to_vec(),
        None => {
            let encoded = signature
                .find("X509Certificate")
                .map(|element| compact(&element.text()))
                .ok_or_else(|| malformed("no X509Certificate and none supplied"))?;
            STANDARD
                .decode(encoded)
                .map_err(|_| malformed("X509Certificate is not base64"))?
        }
    };
    let public_key = public_key_from_certificate(&certificate_der)?;

    let signature_value = STANDARD
        .decode(compact(
            &signature.child_text("SignatureValue").unwrap_or_default(),
        ))
        .map_err(|_| malformed("SignatureValue is not base64"))?;
    algorithm.verify(
        &public_key,
        signed_info.to_canonical(signature_namespace).as_bytes(),
        &signature_value,
    )?;

    Ok(VerifiedSignature {
        access_key,
        algorithm,
        digest_value: declared_digest,
        certificate_der,
    })
}

/// Depth-first search that also tracks the default namespace in scope.
fn find_with_namespace<'a>(
    element: &'a Element,
    local_name: &str,
    inherited: Option<&'a str>,
) -> Option<(&'a Element, Option<&'a str>)> {
    let in_scope = element.attribute("xmlns").or(inherited);
    if element.local_name() == local_name {
        // The element's own declaration applies to its children.
        return Some((element, in_scope));
    }
    element
        .child_elements()
        .find_map(|child| find_with_namespace(child, local_name, in_scope))
}

/// Base64 values may be wrapped across lines by other implementations.
fn compact(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}
